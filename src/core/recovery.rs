//! 错误恢复引擎
//!
//! 编排器是唯一能在「重新规划 / 步骤失败 / 终止」之间做决定的组件（瞬时错误的重试留在执行器内部）；
//! 这里把 AgentError 映射为 RecoveryAction，决策表集中在一处。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    ///
    /// 执行器已经在本地用完了连接重试，所以到这里的 Connection 错误按步骤失败处理。
    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::NoMatchingTool(_) => RecoveryAction::Replan,
            AgentError::ToolExecution { .. }
            | AgentError::Connection { .. }
            | AgentError::Timeout(..)
            | AgentError::PoolExhausted(_)
            | AgentError::Protocol(_) => RecoveryAction::FailStep,
            AgentError::Cancelled
            | AgentError::BudgetExceeded(_)
            | AgentError::InvalidPlan(_)
            | AgentError::InvalidTransition(_)
            | AgentError::ConfigError(_)
            | AgentError::CacheRefresh { .. }
            | AgentError::UnknownServer(_)
            | AgentError::LlmError(_)
            | AgentError::JsonParseError(_)
            | AgentError::Persistence(_) => RecoveryAction::Abort,
        }
    }
}
