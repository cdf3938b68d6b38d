//! 传输层抽象：一条到工具服务端的连接
//!
//! 连接池之上只看到 ToolConnection / Connector 两个 trait，不区分进程管道还是事件流。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ServerEntry, TransportKind};
use crate::core::AgentError;
use crate::tools::protocol::{RemoteTool, ToolResponse};
use crate::tools::sse::SseConnector;
use crate::tools::stdio::StdioConnector;

/// 一条已建立的连接（由连接池独占持有，借出期间归调用方使用）
#[async_trait]
pub trait ToolConnection: Send {
    /// 调用工具；工具自身报告的失败体现在 ToolResponse.success，Err 只表示连接/协议问题
    async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<ToolResponse, AgentError>;

    /// 工具发现
    async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, AgentError>;

    /// 轻量健康探测
    async fn ping(&mut self) -> Result<(), AgentError>;

    /// 主动关闭（子进程退出 / 释放 HTTP 资源）
    async fn close(&mut self) {}
}

/// 建立连接的工厂，每个工具服务端一个
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ToolConnection>, AgentError>;
}

/// 根据 [[servers]] 配置项创建对应传输的 Connector
pub fn connector_for(entry: &ServerEntry) -> Result<Arc<dyn Connector>, AgentError> {
    match entry.transport {
        TransportKind::Stdio => {
            let command = entry.command.clone().ok_or_else(|| {
                AgentError::ConfigError(format!("server '{}' uses stdio but has no command", entry.id))
            })?;
            Ok(Arc::new(StdioConnector::new(
                entry.id.clone(),
                command,
                entry.args.clone(),
                entry.env.clone(),
            )))
        }
        TransportKind::Sse => {
            let url = entry.url.clone().ok_or_else(|| {
                AgentError::ConfigError(format!("server '{}' uses sse but has no url", entry.id))
            })?;
            Ok(Arc::new(SseConnector::new(entry.id.clone(), url, entry.headers.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_requires_command() {
        let entry = ServerEntry {
            id: "fs".to_string(),
            transport: TransportKind::Stdio,
            command: None,
            ..ServerEntry::default()
        };
        assert!(matches!(connector_for(&entry), Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn test_sse_requires_url() {
        let entry = ServerEntry {
            id: "web".to_string(),
            transport: TransportKind::Sse,
            ..ServerEntry::default()
        };
        assert!(connector_for(&entry).is_err());

        let entry = ServerEntry {
            url: Some("http://127.0.0.1:9000".to_string()),
            ..entry
        };
        assert!(connector_for(&entry).is_ok());
    }
}
