//! 进程管道传输：启动工具服务端子进程，stdin/stdout 上按行收发 JSON
//!
//! 子进程 stderr 转发到 tracing（debug），kill_on_drop 保证连接被丢弃时进程一并退出。

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::core::AgentError;
use crate::tools::protocol::{
    parse_tool_list, parse_tool_response, Envelope, RemoteTool, Reply, ToolResponse,
};
use crate::tools::transport::{Connector, ToolConnection};

/// 为某个工具服务端启动子进程
pub struct StdioConnector {
    server_id: String,
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl StdioConnector {
    pub fn new(
        server_id: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            program: program.into(),
            args,
            env,
        }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self) -> Result<Box<dyn ToolConnection>, AgentError> {
        tracing::info!(server = %self.server_id, program = %self.program, "spawning tool server");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::connection(&self.server_id, format!("spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::connection(&self.server_id, "child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::connection(&self.server_id, "child has no stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let server = self.server_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {}", line);
                }
            });
        }

        Ok(Box::new(StdioConnection {
            server_id: self.server_id.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        }))
    }
}

/// 一个子进程即一条连接
pub struct StdioConnection {
    server_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl StdioConnection {
    /// 写一行请求，读到 id 匹配的响应为止；非 JSON 行与过期响应跳过
    async fn request(&mut self, envelope: Envelope) -> Result<Value, AgentError> {
        let mut line = serde_json::to_string(&envelope)
            .map_err(|e| AgentError::Protocol(format!("encode request: {e}")))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::connection(&self.server_id, format!("write: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| AgentError::connection(&self.server_id, format!("flush: {e}")))?;

        loop {
            let next = self
                .stdout
                .next_line()
                .await
                .map_err(|e| AgentError::connection(&self.server_id, format!("read: {e}")))?;
            let Some(raw) = next else {
                return Err(AgentError::connection(&self.server_id, "tool server closed stdout"));
            };
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match serde_json::from_str::<Reply>(raw) {
                Ok(reply) if reply.id == envelope.id => return reply.into_result(),
                Ok(reply) => {
                    tracing::debug!(server = %self.server_id, id = %reply.id, "skipping stale reply");
                }
                Err(_) => {
                    tracing::debug!(server = %self.server_id, "skipping non-protocol line: {}", raw);
                }
            }
        }
    }
}

#[async_trait]
impl ToolConnection for StdioConnection {
    async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<ToolResponse, AgentError> {
        let result = self.request(Envelope::call_tool(tool, arguments)).await?;
        parse_tool_response(result)
    }

    async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, AgentError> {
        let result = self.request(Envelope::list_tools()).await?;
        parse_tool_list(result)
    }

    async fn ping(&mut self) -> Result<(), AgentError> {
        self.request(Envelope::ping()).await.map(|_| ())
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(server = %self.server_id, "kill tool server: {}", e);
        }
    }
}
