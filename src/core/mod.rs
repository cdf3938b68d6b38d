//! 核心编排层：错误与恢复决策、循环阶段、引擎构建与关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use builder::EngineBuilder;
pub use error::{AgentError, BudgetKind, RecoveryAction};
pub use orchestrator::Engine;
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::LoopPhase;
