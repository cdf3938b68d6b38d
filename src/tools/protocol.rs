//! 工具服务端协议报文
//!
//! 两种传输（进程管道 / 事件流）共用同一套 JSON 报文：
//! 请求 `{"id", "method", "params"}`，响应 `{"id", "result"}` 或 `{"id", "error"}`。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::descriptor::{ArgumentSchema, ToolDescriptor};

pub const METHOD_CALL_TOOL: &str = "call_tool";
pub const METHOD_LIST_TOOLS: &str = "list_tools";
pub const METHOD_PING: &str = "ping";

/// 发往工具服务端的请求信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Envelope {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
        }
    }

    pub fn call_tool(tool: &str, arguments: Value) -> Self {
        Self::new(
            METHOD_CALL_TOOL,
            serde_json::json!({ "tool": tool, "arguments": arguments }),
        )
    }

    pub fn list_tools() -> Self {
        Self::new(METHOD_LIST_TOOLS, Value::Null)
    }

    pub fn ping() -> Self {
        Self::new(METHOD_PING, Value::Null)
    }
}

/// 工具服务端的响应信封；error 表示协议层失败（区别于工具自身报告的失败）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// 取出 result；协议错误或缺失 result 都转为 Protocol
    pub fn into_result(self) -> Result<Value, AgentError> {
        if let Some(e) = self.error {
            return Err(AgentError::Protocol(e));
        }
        self.result
            .ok_or_else(|| AgentError::Protocol(format!("reply {} has neither result nor error", self.id)))
    }
}

/// call_tool 的结果：`{success, output | error_message, elapsed_ms}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ToolResponse {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error_message: None,
            elapsed_ms: 0,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error_message: Some(message.into()),
            elapsed_ms: 0,
        }
    }
}

/// list_tools 返回的单个工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub argument_schema: Option<Value>,
    #[serde(default)]
    pub capability_tags: Vec<String>,
}

impl RemoteTool {
    /// 转为本地描述符（统计字段取默认值，由 ToolStats 覆盖）
    pub fn into_descriptor(self, server_id: &str) -> ToolDescriptor {
        let mut d = ToolDescriptor::new(server_id, self.name)
            .with_description(self.description)
            .with_capabilities(self.capability_tags);
        if let Some(schema) = self.argument_schema {
            d.argument_schema = ArgumentSchema::new(schema);
        }
        d
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolList {
    #[serde(default)]
    pub tools: Vec<RemoteTool>,
}

/// 把 call_tool 的 result 解析为 ToolResponse
pub fn parse_tool_response(result: Value) -> Result<ToolResponse, AgentError> {
    serde_json::from_value(result).map_err(|e| AgentError::Protocol(format!("bad call_tool result: {e}")))
}

/// 把 list_tools 的 result 解析为工具列表
pub fn parse_tool_list(result: Value) -> Result<Vec<RemoteTool>, AgentError> {
    let list: ToolList = serde_json::from_value(result)
        .map_err(|e| AgentError::Protocol(format!("bad list_tools result: {e}")))?;
    Ok(list.tools)
}
