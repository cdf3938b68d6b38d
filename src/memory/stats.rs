//! 工具使用统计：滑动窗口成功率 + EWMA 延迟
//!
//! 引擎持有一份共享的 ToolStats（所有目标共用，反馈到选择器打分）；
//! 每个目标的 ConversationMemory 另有一份，只记录本目标内的调用。

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tools::descriptor::ToolDescriptor;

const DEFAULT_WINDOW: usize = 20;
const DEFAULT_ALPHA: f64 = 0.3;

/// 单个工具的滚动统计
#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    pub calls: u64,
    pub failures: u64,
    #[serde(skip)]
    recent: VecDeque<bool>,
    pub avg_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ToolUsage {
    fn new() -> Self {
        Self {
            calls: 0,
            failures: 0,
            recent: VecDeque::new(),
            avg_latency_ms: 0.0,
            last_used: None,
        }
    }

    /// 最近窗口内的成功率；没有记录时为 1.0
    pub fn reliability(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        let ok = self.recent.iter().filter(|s| **s).count();
        ok as f64 / self.recent.len() as f64
    }
}

/// 按 `server/tool` 聚合的统计簿（内部加锁，可经 Arc 共享）
#[derive(Debug)]
pub struct ToolStats {
    window: usize,
    alpha: f64,
    usage: RwLock<HashMap<String, ToolUsage>>,
}

impl Default for ToolStats {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_ALPHA)
    }
}

impl Clone for ToolStats {
    fn clone(&self) -> Self {
        Self {
            window: self.window,
            alpha: self.alpha,
            usage: RwLock::new(self.snapshot()),
        }
    }
}

impl ToolStats {
    /// window：成功率窗口大小；alpha：延迟 EWMA 系数（0~1，越大越偏向最近一次）
    pub fn new(window: usize, alpha: f64) -> Self {
        Self {
            window: window.max(1),
            alpha: alpha.clamp(0.01, 1.0),
            usage: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, key: &str, success: bool, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let Ok(mut usage) = self.usage.write() else {
            return;
        };
        let entry = usage.entry(key.to_string()).or_insert_with(ToolUsage::new);
        entry.avg_latency_ms = if entry.calls == 0 {
            latency_ms
        } else {
            self.alpha * latency_ms + (1.0 - self.alpha) * entry.avg_latency_ms
        };
        entry.calls += 1;
        if !success {
            entry.failures += 1;
        }
        entry.recent.push_back(success);
        while entry.recent.len() > self.window {
            entry.recent.pop_front();
        }
        entry.last_used = Some(Utc::now());
    }

    pub fn get(&self, key: &str) -> Option<ToolUsage> {
        self.usage.read().ok()?.get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, ToolUsage> {
        self.usage.read().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.usage.read().map(|u| u.is_empty()).unwrap_or(true)
    }

    /// 用统计值覆盖描述符的 reliability / avg_latency_ms / last_used；没用过的工具保持原值
    pub fn annotate(&self, descriptor: &ToolDescriptor) -> ToolDescriptor {
        let mut annotated = descriptor.clone();
        if let Some(usage) = self.get(&descriptor.key()) {
            annotated.reliability = usage.reliability();
            annotated.avg_latency_ms = usage.avg_latency_ms;
            annotated.last_used = usage.last_used;
        }
        annotated
    }

    /// 每个工具一行的摘要（按 key 排序）
    pub fn summary(&self) -> String {
        let mut rows: Vec<(String, ToolUsage)> = self.snapshot().into_iter().collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.iter()
            .map(|(key, u)| {
                format!(
                    "- {}: {} calls, {:.0}% ok, ~{:.0}ms",
                    key,
                    u.calls,
                    u.reliability() * 100.0,
                    u.avg_latency_ms
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliability_window() {
        let stats = ToolStats::new(4, 0.5);
        for _ in 0..4 {
            stats.record("fs/read", false, Duration::from_millis(10));
        }
        assert_eq!(stats.get("fs/read").unwrap().reliability(), 0.0);
        for _ in 0..4 {
            stats.record("fs/read", true, Duration::from_millis(10));
        }
        let usage = stats.get("fs/read").unwrap();
        assert_eq!(usage.reliability(), 1.0);
        assert_eq!(usage.calls, 8);
        assert_eq!(usage.failures, 4);
    }

    #[test]
    fn test_ewma_latency() {
        let stats = ToolStats::new(10, 0.5);
        stats.record("k", true, Duration::from_millis(100));
        assert!((stats.get("k").unwrap().avg_latency_ms - 100.0).abs() < 1e-6);
        stats.record("k", true, Duration::from_millis(300));
        assert!((stats.get("k").unwrap().avg_latency_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_annotate_overlays_descriptor() {
        let stats = ToolStats::default();
        let d = ToolDescriptor::new("fs", "read_file");
        assert_eq!(stats.annotate(&d).reliability, 1.0);

        stats.record("fs/read_file", true, Duration::from_millis(40));
        stats.record("fs/read_file", false, Duration::from_millis(40));
        let annotated = stats.annotate(&d);
        assert_eq!(annotated.reliability, 0.5);
        assert!((annotated.avg_latency_ms - 40.0).abs() < 1e-6);
        assert!(annotated.last_used.is_some());
    }

    #[test]
    fn test_summary_sorted() {
        let stats = ToolStats::default();
        stats.record("web/fetch", true, Duration::from_millis(5));
        stats.record("fs/read", true, Duration::from_millis(5));
        let summary = stats.summary();
        assert!(summary.find("fs/read").unwrap() < summary.find("web/fetch").unwrap());
    }
}
