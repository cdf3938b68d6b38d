//! Bee Hive - 工具增强推理引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复决策、循环阶段、Engine 构建与关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 每个目标的对话记忆、工具使用统计、分词
//! - **observability**: tracing 初始化
//! - **react**: 任务上下文、规划、结果观察、推理主循环
//! - **tools**: 工具元数据缓存、连接池与传输、选择器、执行器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{AgentError, Engine, EngineBuilder};
pub use crate::react::{GoalOutcome, GoalReport};
