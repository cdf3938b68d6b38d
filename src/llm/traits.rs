//! LLM 客户端抽象
//!
//! 引擎只通过 complete 一个调用使用模型：LLM 规划器与 LLM 工具排序器。

use async_trait::async_trait;

use crate::memory::Message;

/// LLM 客户端 trait（非流式完成）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 累计 token 使用：(prompt_tokens, completion_tokens, total_tokens)，默认 (0, 0, 0)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
