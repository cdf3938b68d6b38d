//! 对话记忆：最近 N 轮对话 + 当前目标的 TaskContext + 本目标的工具统计
//!
//! 每个目标一份，不跨目标共享。Message / Role 是发给 LLM 的消息格式。

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::stats::ToolStats;
use crate::memory::tokenizer::{jaccard_similarity, tokenize_to_set};
use crate::react::task::TaskContext;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 一轮对话，记录后不再修改
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_input: String,
    pub agent_output: String,
    pub timestamp: DateTime<Utc>,
    pub tool_call_ids: Vec<String>,
}

/// relevant_context 取相似度最高的轮数
const RELEVANT_TURNS: usize = 3;

#[derive(Debug)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    window: usize,
    active: Option<TaskContext>,
    tool_stats: ToolStats,
}

impl ConversationMemory {
    pub fn new(window: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            window: window.max(1),
            active: None,
            tool_stats: ToolStats::default(),
        }
    }

    /// 追加一轮；超出窗口时丢弃最旧的
    pub fn add_turn(
        &mut self,
        user_input: impl Into<String>,
        agent_output: impl Into<String>,
        tool_call_ids: Vec<String>,
    ) {
        self.turns.push_back(ConversationTurn {
            user_input: user_input.into(),
            agent_output: agent_output.into(),
            timestamp: Utc::now(),
            tool_call_ids,
        });
        while self.turns.len() > self.window {
            self.turns.pop_front();
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn active_context(&self) -> Option<&TaskContext> {
        self.active.as_ref()
    }

    pub fn active_context_mut(&mut self) -> Option<&mut TaskContext> {
        self.active.as_mut()
    }

    /// 整体替换当前任务上下文，返回旧的
    pub fn set_active_context(&mut self, ctx: TaskContext) -> Option<TaskContext> {
        self.active.replace(ctx)
    }

    pub fn take_active_context(&mut self) -> Option<TaskContext> {
        self.active.take()
    }

    pub fn record_tool_usage(&self, tool_key: &str, success: bool, latency: Duration) {
        self.tool_stats.record(tool_key, success, latency);
    }

    pub fn tool_stats(&self) -> &ToolStats {
        &self.tool_stats
    }

    /// 拼给规划器 / 排序器的上下文：当前目标与步骤状态、最相关的几轮对话、工具使用摘要
    pub fn relevant_context(&self, query: &str) -> String {
        let mut sections = Vec::new();

        if let Some(ctx) = &self.active {
            let mut s = format!("Goal: {}\nSteps:", ctx.goal);
            for step in &ctx.steps {
                s.push_str(&format!("\n- [{:?}] {}: {}", step.status, step.id, step.description));
                if let Some(err) = &step.error {
                    s.push_str(&format!(" (error: {err})"));
                }
            }
            sections.push(s);
        }

        let query_tokens = tokenize_to_set(query);
        let mut scored: Vec<(f32, usize, &ConversationTurn)> = self
            .turns
            .iter()
            .enumerate()
            .map(|(i, turn)| {
                let text = format!("{} {}", turn.user_input, turn.agent_output);
                (jaccard_similarity(&query_tokens, &tokenize_to_set(&text)), i, turn)
            })
            .filter(|(score, _, _)| *score > 0.0)
            .collect();
        // 分数相同时新的优先
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        if !scored.is_empty() {
            let mut s = String::from("Relevant history:");
            for (_, _, turn) in scored.into_iter().take(RELEVANT_TURNS) {
                s.push_str(&format!("\nUser: {}\nAgent: {}", turn.user_input, turn.agent_output));
            }
            sections.push(s);
        }

        if !self.tool_stats.is_empty() {
            sections.push(format!("Tool usage:\n{}", self.tool_stats.summary()));
        }

        sections.join("\n\n")
    }
}
