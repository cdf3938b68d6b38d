//! 动作执行器
//!
//! execute(descriptor, arguments, cancel)：校验参数 → 经连接池取连接 → 在超时内调用 → 归还连接。
//! 连接错误与调用超时属于瞬时故障，退避后重试（连接本身由池退役）；工具自己报告的失败不重试，作为失败的 ActionResult 返回。
//! 取消时在途调用被丢弃，PoolGuard 未 release 即 drop，连接随之退役。
//! 每次调用都写入共享 ToolStats，并输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorSection;
use crate::core::AgentError;
use crate::memory::ToolStats;
use crate::tools::descriptor::ToolDescriptor;
use crate::tools::pool::{CallOutcome, ConnectionPool};
use crate::tools::protocol::ToolResponse;

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 含首次在内
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待时间：base × 2^(attempt-1)，不超过 max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ExecutorSection::default())
    }
}

impl From<&ExecutorSection> for ExecutorConfig {
    fn from(s: &ExecutorSection) -> Self {
        Self {
            call_timeout: Duration::from_millis(s.call_timeout_ms),
            retry: RetryPolicy {
                max_attempts: s.max_attempts.max(1),
                base_delay: Duration::from_millis(s.backoff_base_ms),
                max_delay: Duration::from_millis(s.backoff_max_ms),
            },
        }
    }
}

/// 一次工具调用的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub tool: String,
    pub server_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub attempts: u32,
}

impl ActionResult {
    fn from_response(descriptor: &ToolDescriptor, resp: ToolResponse, elapsed: Duration, attempts: u32) -> Self {
        Self {
            tool: descriptor.name.clone(),
            server_id: descriptor.server_id.clone(),
            success: resp.success,
            output: resp.output,
            error: if resp.success {
                None
            } else {
                Some(resp.error_message.unwrap_or_else(|| "tool reported failure".to_string()))
            },
            elapsed_ms: elapsed.as_millis() as u64,
            attempts,
        }
    }

    fn rejected(descriptor: &ToolDescriptor, message: String) -> Self {
        Self {
            tool: descriptor.name.clone(),
            server_id: descriptor.server_id.clone(),
            success: false,
            output: None,
            error: Some(message),
            elapsed_ms: 0,
            attempts: 0,
        }
    }
}

pub struct ActionExecutor {
    pool: Arc<ConnectionPool>,
    stats: Arc<ToolStats>,
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(pool: Arc<ConnectionPool>, stats: Arc<ToolStats>, config: ExecutorConfig) -> Self {
        Self { pool, stats, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// 执行一次工具调用
    ///
    /// Ok：工具给出了回答（success 可能为 false）或参数校验未通过；
    /// Err：重试用尽的连接 / 超时错误、协议错误、取消等，交给编排器决策。
    pub async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ActionResult, AgentError> {
        let start = Instant::now();
        let args_preview = args_preview(&arguments);

        if let Err(msg) = descriptor.argument_schema.check(&arguments) {
            audit(descriptor, "invalid_args", 0, start.elapsed(), &args_preview);
            return Ok(ActionResult::rejected(descriptor, format!("invalid arguments: {msg}")));
        }

        let policy = &self.config.retry;
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                r = self.attempt_once(descriptor, arguments.clone()) => r,
            };
            match outcome {
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::debug!(
                        tool = %descriptor.key(),
                        attempt,
                        error = %e,
                        "transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => break other,
            }
        };

        let elapsed = start.elapsed();
        match result {
            Ok(resp) => {
                let action = ActionResult::from_response(descriptor, resp, elapsed, attempt);
                self.stats.record(&descriptor.key(), action.success, elapsed);
                let label = if action.success { "ok" } else { "tool_error" };
                audit(descriptor, label, attempt, elapsed, &args_preview);
                Ok(action)
            }
            Err(e) => {
                self.stats.record(&descriptor.key(), false, elapsed);
                let label = match &e {
                    AgentError::Cancelled => "cancelled",
                    AgentError::Timeout(..) => "timeout",
                    AgentError::Connection { .. } => "connection_error",
                    _ => "error",
                };
                audit(descriptor, label, attempt, elapsed, &args_preview);
                Err(e)
            }
        }
    }

    /// 单次尝试：借连接、限时调用、按结果归还
    async fn attempt_once(&self, descriptor: &ToolDescriptor, arguments: Value) -> Result<ToolResponse, AgentError> {
        let mut guard = self.pool.acquire(&descriptor.server_id).await?;
        let call = guard.connection().call_tool(&descriptor.name, arguments);
        match timeout(self.config.call_timeout, call).await {
            Ok(Ok(resp)) => {
                let outcome = if resp.success {
                    CallOutcome::Success
                } else {
                    CallOutcome::ToolError
                };
                guard.release(outcome);
                Ok(resp)
            }
            Ok(Err(e)) => {
                guard.release(CallOutcome::ConnectionError);
                Err(e)
            }
            Err(_) => {
                guard.release(CallOutcome::Timeout);
                Err(AgentError::Timeout(self.config.call_timeout, descriptor.key()))
            }
        }
    }
}

fn audit(descriptor: &ToolDescriptor, outcome: &str, attempts: u32, elapsed: Duration, args_preview: &str) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "server": descriptor.server_id,
        "tool": descriptor.name,
        "ok": outcome == "ok",
        "outcome": outcome,
        "attempts": attempts,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
