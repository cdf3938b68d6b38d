//! 事件流传输：HTTP POST 请求信封，响应按 text/event-stream 读取（也接受纯 JSON）
//!
//! 每个 `data:` 事件是一个 Reply；取 id 与请求一致的那一个。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::protocol::{
    parse_tool_list, parse_tool_response, Envelope, RemoteTool, Reply, ToolResponse,
};
use crate::tools::transport::{Connector, ToolConnection};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 事件流工具服务端的连接工厂
pub struct SseConnector {
    server_id: String,
    url: String,
    headers: HashMap<String, String>,
}

impl SseConnector {
    pub fn new(server_id: impl Into<String>, url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            server_id: server_id.into(),
            url: url.into(),
            headers,
        }
    }

    fn header_map(&self) -> Result<HeaderMap, AgentError> {
        let mut map = HeaderMap::new();
        map.insert(ACCEPT, HeaderValue::from_static("text/event-stream, application/json"));
        for (k, v) in &self.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| AgentError::ConfigError(format!("header name {k}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| AgentError::ConfigError(format!("header value for {k}: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self) -> Result<Box<dyn ToolConnection>, AgentError> {
        let client = reqwest::Client::builder()
            .default_headers(self.header_map()?)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AgentError::connection(&self.server_id, e))?;
        let mut conn = SseConnection {
            server_id: self.server_id.clone(),
            url: self.url.clone(),
            client,
        };
        // HTTP 本身无状态，建连时先 ping 一次确认服务端可达
        conn.ping().await?;
        Ok(Box::new(conn))
    }
}

pub struct SseConnection {
    server_id: String,
    url: String,
    client: reqwest::Client,
}

impl SseConnection {
    async fn request(&mut self, envelope: Envelope) -> Result<Value, AgentError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| AgentError::connection(&self.server_id, e))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(AgentError::connection(&self.server_id, format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(AgentError::Protocol(format!("{}: HTTP {status}", self.server_id)));
        }

        let is_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        let body = resp
            .text()
            .await
            .map_err(|e| AgentError::connection(&self.server_id, e))?;

        let reply = if is_stream {
            find_reply(&body, &envelope.id).ok_or_else(|| {
                AgentError::Protocol(format!("{}: no event for request {}", self.server_id, envelope.id))
            })?
        } else {
            serde_json::from_str::<Reply>(&body)
                .map_err(|e| AgentError::Protocol(format!("{}: bad reply: {e}", self.server_id)))?
        };
        reply.into_result()
    }
}

#[async_trait]
impl ToolConnection for SseConnection {
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
}

/// 将 event-stream 文本切为事件的 data 负载（多行 data 以 \n 拼接）
pub(crate) fn event_payloads(body: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !current.is_empty() {
                payloads.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            current.push(data.strip_prefix(' ').unwrap_or(data));
        }
        // event: / id: / retry: / 注释行不影响负载
    }
    if !current.is_empty() {
        payloads.push(current.join("\n"));
    }
    payloads
}

fn find_reply(body: &str, id: &str) -> Option<Reply> {
    event_payloads(body)
        .into_iter()
        .filter_map(|p| serde_json::from_str::<Reply>(&p).ok())
        .find(|r| r.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payloads_multiline() {
        let body = "event: message\ndata: {\"a\":\ndata: 1}\n\n: keepalive\n\ndata: last";
        let p = event_payloads(body);
        assert_eq!(p, vec!["{\"a\":\n1}".to_string(), "last".to_string()]);
    }

    #[test]
    fn test_find_reply_matches_id() {
        let body = "data: {\"id\":\"other\",\"result\":1}\n\ndata: {\"id\":\"mine\",\"result\":{\"ok\":true}}\n\n";
        let reply = find_reply(body, "mine").unwrap();
        assert_eq!(reply.result.unwrap()["ok"], true);
        assert!(find_reply(body, "missing").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let connector = SseConnector::new("web", "http://127.0.0.1:1/rpc", HashMap::new());
        let err = connector.connect().await.err().unwrap();
        assert!(err.is_transient());
    }
}
