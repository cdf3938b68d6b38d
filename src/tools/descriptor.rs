//! 工具描述符：缓存刷新时产出，其它组件只读
//!
//! 每个工具带显式的参数 schema 与能力标签；选择与分发都按标签查找，不做运行时内省。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具参数 schema（JSON Schema 的一个子集：object + properties + required）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentSchema(pub Value);

impl Default for ArgumentSchema {
    fn default() -> Self {
        Self(serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        }))
    }
}

impl ArgumentSchema {
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// schema 中声明的必填字段
    pub fn required_fields(&self) -> Vec<&str> {
        self.0
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// 某个属性声明的类型（"string" / "number" / ...）
    pub fn property_type(&self, field: &str) -> Option<&str> {
        self.0
            .get("properties")
            .and_then(|p| p.get(field))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
    }

    /// 轻量校验：参数必须是对象，必填字段必须存在，已声明类型的字段类型必须一致
    pub fn check(&self, args: &Value) -> Result<(), String> {
        let obj = args
            .as_object()
            .ok_or_else(|| format!("arguments must be a JSON object, got {}", args))?;
        for field in self.required_fields() {
            if !obj.contains_key(field) {
                return Err(format!("missing required argument '{field}'"));
            }
        }
        for (key, value) in obj {
            if let Some(expected) = self.property_type(key) {
                if !type_matches(expected, value) {
                    return Err(format!("argument '{key}' should be of type {expected}"));
                }
            }
        }
        Ok(())
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// 单个可调用工具的元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub server_id: String,
    #[serde(default)]
    pub description: String,
    /// 能力标签（小写），选择器据此匹配步骤
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub argument_schema: ArgumentSchema,
    /// 滚动成功率（0.0 ~ 1.0）
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    /// 滚动平均延迟（毫秒）
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

fn default_reliability() -> f64 {
    1.0
}

impl ToolDescriptor {
    pub fn new(server_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_id: server_id.into(),
            description: String::new(),
            capabilities: Vec::new(),
            argument_schema: ArgumentSchema::default(),
            reliability: default_reliability(),
            avg_latency_ms: 0.0,
            last_used: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = tags.into_iter().map(|t| t.into().to_lowercase()).collect();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.argument_schema = ArgumentSchema::new(schema);
        self
    }

    /// 全局唯一键：server/tool
    pub fn key(&self) -> String {
        format!("{}/{}", self.server_id, self.name)
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }
}
