//! 引擎错误类型与恢复动作
//!
//! 各层只负责把失败映射为带类型的 AgentError 向上传递；
//! 是否重试 / 重新规划 / 终止，统一由编排器借助 RecoveryEngine 决定。

use std::time::Duration;

use thiserror::Error;

/// 引擎运行过程中可能出现的错误（连接、工具、选择、预算、缓存等）
///
/// 需要 Clone：单飞刷新时同一个结果要分发给所有等待者。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 连接层错误（建立连接失败、管道断开、HTTP 传输失败），可重试
    #[error("Connection error ({server}): {message}")]
    Connection { server: String, message: String },

    /// 工具自身报告失败，不重试，作为失败步骤上报
    #[error("Tool execution failed ({tool}): {message}")]
    ToolExecution { tool: String, message: String },

    /// 没有任何工具达到能力标签阈值
    #[error("No matching tool for step: {0}")]
    NoMatchingTool(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(BudgetKind),

    /// 工具发现调用失败且没有可用的旧条目
    #[error("Cache refresh failed ({server}): {message}")]
    CacheRefresh { server: String, message: String },

    #[error("Timeout after {0:?}: {1}")]
    Timeout(Duration, String),

    /// 在获取超时内拿不到连接
    #[error("Connection pool exhausted for {0}")]
    PoolExhausted(String),

    #[error("Unknown tool server: {0}")]
    UnknownServer(String),

    /// 工具服务端返回了无法理解的报文
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// 违反步骤状态机（如前置步骤未完成就进入 running）
    #[error("Invalid step transition: {0}")]
    InvalidTransition(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// 预算耗尽的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    /// 迭代次数达到上限（记录实际执行的迭代数）
    Iterations(usize),
    /// 超过墙钟截止时间
    Deadline(Duration),
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetKind::Iterations(n) => write!(f, "iteration limit reached after {n} iterations"),
            BudgetKind::Deadline(d) => write!(f, "deadline of {:?} passed", d),
        }
    }
}

impl AgentError {
    pub fn connection(server: impl Into<String>, message: impl ToString) -> Self {
        AgentError::Connection {
            server: server.into(),
            message: message.to_string(),
        }
    }

    /// 连接级错误与调用超时视为瞬时错误，执行器可以换一条连接重试
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Connection { .. } | AgentError::Timeout(..))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 交给 Planner 重新规划（如找不到匹配工具）
    Replan,
    /// 当前步骤失败，依赖它的步骤不再推进，独立步骤继续
    FailStep,
    /// 终止当前目标
    Abort,
}
