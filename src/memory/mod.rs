//! 记忆层：每个目标的对话记忆、工具使用统计、分词

pub mod conversation;
pub mod stats;
pub mod tokenizer;

pub use conversation::{ConversationMemory, ConversationTurn, Message, Role};
pub use stats::{ToolStats, ToolUsage};
