//! 工具元数据缓存
//!
//! - 每个工具服务端一个条目（工具列表 + 获取时间 + ttl + valid）
//! - get / lookup：条目有效且未过期直接返回，否则经连接池调用 list_tools 刷新后返回
//! - 单飞：同一服务端同一时刻最多一个刷新在途，其余调用方等待同一结果；
//!   刷新放在独立任务里跑，调用方被取消不会影响其他等待者
//! - 刷新失败按 refresh_retries 重试；仍失败时若有旧条目则带 warn 日志返回旧数据（Stale），否则报 CacheRefresh
//! - persist / load：经 CacheStore 落盘与预热

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheSection;
use crate::core::AgentError;
use crate::tools::descriptor::ToolDescriptor;
use crate::tools::pool::{CallOutcome, ConnectionPool};
use crate::tools::store::{CacheRecord, CacheStore};

type RefreshResult = Result<Vec<ToolDescriptor>, AgentError>;
type RefreshFuture = Shared<BoxFuture<'static, RefreshResult>>;

/// 缓存参数
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// 首次刷新失败后的额外重试次数
    pub refresh_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_retries: 2,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl From<&CacheSection> for CacheConfig {
    fn from(s: &CacheSection) -> Self {
        Self {
            ttl: Duration::from_secs(s.ttl_secs),
            refresh_retries: s.refresh_retries,
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
        }
    }
}

/// 单个服务端的缓存条目
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub server_id: String,
    pub tools: Vec<ToolDescriptor>,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    pub valid: bool,
}

impl CacheEntry {
    fn new(server_id: &str, tools: Vec<ToolDescriptor>, ttl: Duration) -> Self {
        Self {
            server_id: server_id.to_string(),
            tools,
            fetched_at: Utc::now(),
            ttl,
            valid: true,
        }
    }

    /// valid 且年龄不超过 ttl
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if !self.valid {
            return false;
        }
        match (now - self.fetched_at).to_std() {
            Ok(age) => age <= self.ttl,
            // fetched_at 在未来（时钟回拨）：视为刚获取
            Err(_) => true,
        }
    }

    fn to_record(&self) -> CacheRecord {
        CacheRecord {
            server_id: self.server_id.clone(),
            fetched_at: self.fetched_at,
            ttl_seconds: self.ttl.as_secs(),
            tools: self.tools.clone(),
        }
    }

    fn from_record(record: CacheRecord) -> Self {
        Self {
            server_id: record.server_id,
            tools: record.tools,
            fetched_at: record.fetched_at,
            ttl: Duration::from_secs(record.ttl_seconds),
            valid: true,
        }
    }
}

/// 返回的工具列表来自哪里
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Freshness {
    Cached,
    Refreshed,
    /// 刷新失败，降级返回过期数据（已记 warn 日志）
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub tools: Vec<ToolDescriptor>,
    pub freshness: Freshness,
}

/// 工具元数据缓存；clone 共享同一份状态
#[derive(Clone)]
pub struct ToolCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    pool: Arc<ConnectionPool>,
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, RefreshFuture>>,
    store: Option<Arc<dyn CacheStore>>,
}

impl ToolCache {
    pub fn new(pool: Arc<ConnectionPool>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                pool,
                config,
                entries: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                store: None,
            }),
        }
    }

    /// 挂载持久化后端（构建期调用）
    pub fn with_store(pool: Arc<ConnectionPool>, config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                pool,
                config,
                entries: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                store: Some(store),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// 连接池里登记的全部服务端
    pub fn servers(&self) -> Vec<String> {
        self.inner.pool.server_ids()
    }

    /// 取某服务端的工具列表（必要时刷新）
    pub async fn get(&self, server_id: &str) -> Result<Vec<ToolDescriptor>, AgentError> {
        self.lookup(server_id).await.map(|l| l.tools)
    }

    /// 同 get，并告知结果是命中、刷新还是降级
    pub async fn lookup(&self, server_id: &str) -> Result<CacheLookup, AgentError> {
        if let Some(tools) = self.fresh_tools(server_id) {
            return Ok(CacheLookup {
                tools,
                freshness: Freshness::Cached,
            });
        }

        let refresh = match self.join_or_start_refresh(server_id) {
            Ok(refresh) => refresh,
            // 持锁期间另一个刷新刚好完成
            Err(tools) => {
                return Ok(CacheLookup {
                    tools,
                    freshness: Freshness::Cached,
                })
            }
        };

        match refresh.await {
            Ok(tools) => Ok(CacheLookup {
                tools,
                freshness: Freshness::Refreshed,
            }),
            Err(e) => {
                let stale = self
                    .inner
                    .entries
                    .lock()
                    .ok()
                    .and_then(|entries| entries.get(server_id).map(|entry| entry.tools.clone()));
                match stale {
                    Some(tools) => {
                        tracing::warn!(
                            server = %server_id,
                            error = %e,
                            "tool discovery failed, serving stale cache entry"
                        );
                        Ok(CacheLookup {
                            tools,
                            freshness: Freshness::Stale,
                        })
                    }
                    None => Err(e),
                }
            }
        }
    }

    fn fresh_tools(&self, server_id: &str) -> Option<Vec<ToolDescriptor>> {
        let entries = self.inner.entries.lock().ok()?;
        entries
            .get(server_id)
            .filter(|entry| entry.is_fresh(Utc::now()))
            .map(|entry| entry.tools.clone())
    }

    /// 加入在途刷新，没有则启动一个；Err 表示持锁复查时条目已新鲜
    fn join_or_start_refresh(&self, server_id: &str) -> Result<RefreshFuture, Vec<ToolDescriptor>> {
        let mut inflight = match self.inner.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = inflight.get(server_id) {
            return Ok(existing.clone());
        }
        if let Some(tools) = self.fresh_tools(server_id) {
            return Err(tools);
        }

        tracing::debug!(server = %server_id, "starting tool discovery");
        let inner = Arc::clone(&self.inner);
        let server = server_id.to_string();
        let handle: JoinHandle<RefreshResult> = tokio::spawn(async move {
            let result = discover(&inner, &server).await;
            if let Ok(tools) = &result {
                if let Ok(mut entries) = inner.entries.lock() {
                    entries.insert(server.clone(), CacheEntry::new(&server, tools.clone(), inner.config.ttl));
                }
            }
            if let Ok(mut inflight) = inner.inflight.lock() {
                inflight.remove(&server);
            }
            result
        });

        let server = server_id.to_string();
        let shared = async move {
            handle.await.unwrap_or_else(|e| {
                Err(AgentError::CacheRefresh {
                    server,
                    message: format!("refresh task aborted: {e}"),
                })
            })
        }
        .boxed()
        .shared();
        inflight.insert(server_id.to_string(), shared.clone());
        Ok(shared)
    }

    /// 标记失效，下一次 get 必定刷新
    pub fn invalidate(&self, server_id: &str) {
        if let Ok(mut entries) = self.inner.entries.lock() {
            if let Some(entry) = entries.get_mut(server_id) {
                entry.valid = false;
                tracing::debug!(server = %server_id, "cache entry invalidated");
            }
        }
    }

    /// 当前全部条目的快照（按 server_id 排序）
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut list: Vec<CacheEntry> = self
            .inner
            .entries
            .lock()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        list
    }

    /// 全部有效条目写入持久化后端，返回写入条数；未配置后端时为 0
    pub async fn persist(&self) -> anyhow::Result<usize> {
        let Some(store) = self.inner.store.clone() else {
            return Ok(0);
        };
        let records: Vec<CacheRecord> = self
            .entries()
            .iter()
            .filter(|entry| entry.valid)
            .map(CacheEntry::to_record)
            .collect();
        let count = records.len();
        tokio::task::spawn_blocking(move || store.save(&records)).await??;
        tracing::info!(entries = count, "tool cache persisted");
        Ok(count)
    }

    /// 从持久化后端预热；不覆盖内存中更新的条目，返回载入条数
    pub async fn load(&self) -> anyhow::Result<usize> {
        let Some(store) = self.inner.store.clone() else {
            return Ok(0);
        };
        let records = tokio::task::spawn_blocking(move || store.load_all()).await??;
        let mut loaded = 0;
        if let Ok(mut entries) = self.inner.entries.lock() {
            for record in records {
                let newer_in_memory = entries
                    .get(&record.server_id)
                    .map(|e| e.fetched_at >= record.fetched_at)
                    .unwrap_or(false);
                if newer_in_memory {
                    continue;
                }
                entries.insert(record.server_id.clone(), CacheEntry::from_record(record));
                loaded += 1;
            }
        }
        tracing::info!(entries = loaded, "tool cache warmed from store");
        Ok(loaded)
    }

    /// 周期性落盘，cancel 后再写一次并退出
    pub fn spawn_persist(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.persist().await {
                            tracing::warn!("periodic cache persist failed: {}", e);
                        }
                    }
                }
            }
            if let Err(e) = cache.persist().await {
                tracing::warn!("final cache persist failed: {}", e);
            }
        })
    }
}

/// 经连接池调用 list_tools，失败按配置重试
async fn discover(inner: &CacheInner, server_id: &str) -> RefreshResult {
    let attempts = inner.config.refresh_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match discover_once(&inner.pool, server_id).await {
            Ok(tools) => {
                tracing::info!(server = %server_id, tools = tools.len(), attempt, "tool discovery succeeded");
                return Ok(tools);
            }
            Err(e @ AgentError::UnknownServer(_)) => return Err(e),
            Err(e) => {
                tracing::debug!(server = %server_id, attempt, error = %e, "tool discovery attempt failed");
                last_error = e.to_string();
                if attempt < attempts {
                    let backoff = inner.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    Err(AgentError::CacheRefresh {
        server: server_id.to_string(),
        message: last_error,
    })
}

async fn discover_once(pool: &ConnectionPool, server_id: &str) -> RefreshResult {
    let mut guard = pool.acquire(server_id).await?;
    match guard.connection().list_tools().await {
        Ok(remote) => {
            guard.release(CallOutcome::Success);
            Ok(remote
                .into_iter()
                .map(|tool| tool.into_descriptor(server_id))
                .collect())
        }
        Err(e) => {
            guard.release(CallOutcome::ConnectionError);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::mock::MockToolServer;
    use crate::tools::pool::PoolConfig;
    use crate::tools::protocol::ToolResponse;
    use crate::tools::store::JsonDirStore;
    use serde_json::json;

    fn server() -> MockToolServer {
        MockToolServer::new("fs").tool("read_file", &["fs", "read"], |_| ToolResponse::success(json!("ok")))
    }

    fn cache_for(server: &MockToolServer, ttl: Duration) -> ToolCache {
        let pool = ConnectionPool::new(PoolConfig::default()).with_server(server.id(), Arc::new(server.clone()));
        let config = CacheConfig {
            ttl,
            refresh_retries: 1,
            retry_backoff: Duration::from_millis(5),
        };
        ToolCache::new(Arc::new(pool), config)
    }

    #[tokio::test]
    async fn test_get_caches_within_ttl() {
        let server = server();
        let cache = cache_for(&server, Duration::from_secs(60));

        let first = cache.lookup("fs").await.unwrap();
        assert_eq!(first.freshness, Freshness::Refreshed);
        assert_eq!(first.tools[0].name, "read_file");
        assert_eq!(first.tools[0].server_id, "fs");

        let second = cache.lookup("fs").await.unwrap();
        assert_eq!(second.freshness, Freshness::Cached);
        assert_eq!(server.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let server = server();
        let cache = cache_for(&server, Duration::from_millis(20));
        cache.get("fs").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        server.add_tool("write_file", &["fs", "write"], None, |_| ToolResponse::success(json!("ok")));
        let lookup = cache.lookup("fs").await.unwrap();
        assert_eq!(lookup.freshness, Freshness::Refreshed);
        assert_eq!(lookup.tools.len(), 2);
        assert_eq!(server.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let server = server();
        let cache = cache_for(&server, Duration::from_secs(60));
        cache.get("fs").await.unwrap();
        cache.invalidate("fs");
        assert_eq!(cache.lookup("fs").await.unwrap().freshness, Freshness::Refreshed);
        assert_eq!(server.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_gets_single_flight() {
        let server = server();
        server.set_list_delay(Duration::from_millis(50));
        let cache = cache_for(&server, Duration::from_secs(60));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c = cache.clone();
                tokio::spawn(async move { c.get("fs").await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(server.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_strand_waiters() {
        let server = server();
        server.set_list_delay(Duration::from_millis(50));
        let cache = cache_for(&server, Duration::from_secs(60));

        let c = cache.clone();
        let first = tokio::spawn(async move { c.get("fs").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        assert_eq!(cache.get("fs").await.unwrap().len(), 1);
        assert_eq!(server.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_serves_stale() {
        let server = server();
        let cache = cache_for(&server, Duration::from_millis(10));
        cache.get("fs").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.set_list_failure(true);
        let lookup = cache.lookup("fs").await.unwrap();
        assert_eq!(lookup.freshness, Freshness::Stale);
        assert_eq!(lookup.tools.len(), 1);
        // 1 次成功 + 1 次失败 + 1 次重试
        assert_eq!(server.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_refresh_failure_without_entry_errors() {
        let server = server();
        server.set_list_failure(true);
        let cache = cache_for(&server, Duration::from_secs(60));
        let err = cache.get("fs").await.unwrap_err();
        assert!(matches!(err, AgentError::CacheRefresh { .. }));
    }

    #[tokio::test]
    async fn test_unknown_server_not_retried() {
        let server = server();
        let cache = cache_for(&server, Duration::from_secs(60));
        assert!(matches!(cache.get("nope").await, Err(AgentError::UnknownServer(_))));
    }

    #[tokio::test]
    async fn test_persist_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let server = server();
        let store: Arc<dyn CacheStore> = Arc::new(JsonDirStore::new(dir.path()));

        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()).with_server("fs", Arc::new(server.clone())));
        let cache = ToolCache::with_store(pool.clone(), CacheConfig::default(), store.clone());
        let before = cache.get("fs").await.unwrap();
        assert_eq!(cache.persist().await.unwrap(), 1);

        let restarted = ToolCache::with_store(pool, CacheConfig::default(), store);
        assert_eq!(restarted.load().await.unwrap(), 1);
        let lookup = restarted.lookup("fs").await.unwrap();
        assert_eq!(lookup.freshness, Freshness::Cached);
        assert_eq!(lookup.tools, before);
        assert_eq!(server.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_loaded_entry_still_subject_to_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonDirStore::new(dir.path()));
        store
            .save(&[CacheRecord {
                server_id: "fs".to_string(),
                fetched_at: Utc::now() - chrono::Duration::hours(2),
                ttl_seconds: 60,
                tools: vec![ToolDescriptor::new("fs", "old_tool")],
            }])
            .unwrap();

        let server = server();
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()).with_server("fs", Arc::new(server.clone())));
        let cache = ToolCache::with_store(pool, CacheConfig::default(), store);
        cache.load().await.unwrap();

        let lookup = cache.lookup("fs").await.unwrap();
        assert_eq!(lookup.freshness, Freshness::Refreshed);
        assert_eq!(lookup.tools[0].name, "read_file");
    }
}
