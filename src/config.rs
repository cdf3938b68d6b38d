//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__POOL__MAX_CONNECTIONS_PER_SERVER=8`）。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::AgentError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub pool: PoolSection,
    pub cache: CacheSection,
    pub executor: ExecutorSection,
    pub selector: SelectorSection,
    /// [[servers]]：工具服务端列表
    pub servers: Vec<ServerEntry>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 每个目标保留的对话轮数
    pub max_context_turns: usize,
    /// 日志格式：text / json
    pub log_format: LogFormat,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: 20,
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// [llm] 段：none 表示不接模型，规划与选工具都走规则
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// none / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
        }
    }
}

/// 规划器 / 排序器用哪种策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Rule,
    Llm,
}

/// [engine] 段：推理循环的预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 迭代上限（硬上限，复杂度预算不会超过它）
    pub max_iterations: usize,
    /// 单个目标的墙钟期限（毫秒）
    pub deadline_ms: u64,
    /// 每个步骤因找不到工具而重新规划的次数上限
    pub max_replans_per_step: u32,
    /// 成功判定未满足时，同一步骤最多执行几次
    pub max_step_attempts: u32,
    pub simple_budget: usize,
    pub moderate_budget: usize,
    pub complex_budget: usize,
    pub planner: StrategyKind,
    /// 连接池空闲回收周期（秒）
    pub reaper_interval_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            deadline_ms: 300_000,
            max_replans_per_step: 1,
            max_step_attempts: 2,
            simple_budget: 4,
            moderate_budget: 10,
            complex_budget: 20,
            planner: StrategyKind::Rule,
            reaper_interval_secs: 30,
        }
    }
}

/// [pool] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_connections_per_server: usize,
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    /// 空闲超过该时长的连接复用前先 ping
    pub probe_after_secs: u64,
    pub max_consecutive_errors: u32,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections_per_server: 4,
            acquire_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            idle_timeout_secs: 300,
            probe_after_secs: 30,
            max_consecutive_errors: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    None,
    Json,
    Sqlite,
}

/// [cache] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,
    pub refresh_retries: u32,
    pub retry_backoff_ms: u64,
    pub backend: CacheBackend,
    /// json：目录；sqlite：数据库文件。未设置时用 ./.bee-hive/tool_cache(.db)
    pub path: Option<PathBuf>,
    /// 周期性落盘间隔（秒），0 表示只在关闭时落盘
    pub persist_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            refresh_retries: 2,
            retry_backoff_ms: 200,
            backend: CacheBackend::Json,
            path: None,
            persist_interval_secs: 0,
        }
    }
}

impl CacheSection {
    pub fn resolved_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(p), _) => p.clone(),
            (None, CacheBackend::Sqlite) => PathBuf::from(".bee-hive/tool_cache.db"),
            (None, _) => PathBuf::from(".bee-hive/tool_cache"),
        }
    }
}

/// [executor] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub call_timeout_ms: u64,
    /// 含首次在内的最大尝试次数
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
        }
    }
}

/// [selector] 段：打分权重与阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub ranker: StrategyKind,
    pub weight_tags: f64,
    pub weight_reliability: f64,
    pub weight_latency: f64,
    /// 步骤给出能力标签时，标签覆盖率低于该值的工具被丢弃
    pub min_tag_overlap: f64,
    /// 步骤没给标签时，描述相似度低于该值的工具被丢弃
    pub min_text_similarity: f64,
    /// 与最高分相差不超过该值的候选交给 LLM 排序
    pub ambiguity_margin: f64,
    pub max_llm_candidates: usize,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            ranker: StrategyKind::Rule,
            weight_tags: 0.6,
            weight_reliability: 0.3,
            weight_latency: 0.1,
            min_tag_overlap: 0.5,
            min_text_similarity: 0.1,
            ambiguity_margin: 0.05,
            max_llm_candidates: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
}

/// [[servers]] 项：一个工具服务端的连接参数
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// stdio：可执行文件
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// sse：端点 URL
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl AppConfig {
    /// 加载后的一致性检查
    pub fn validate(&self) -> Result<(), AgentError> {
        let mut ids = HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return Err(AgentError::ConfigError("server with empty id".to_string()));
            }
            if !ids.insert(server.id.as_str()) {
                return Err(AgentError::ConfigError(format!("duplicate server id '{}'", server.id)));
            }
        }
        if self.pool.max_connections_per_server == 0 {
            return Err(AgentError::ConfigError(
                "pool.max_connections_per_server must be at least 1".to_string(),
            ));
        }
        if self.engine.max_iterations == 0 {
            return Err(AgentError::ConfigError("engine.max_iterations must be at least 1".to_string()));
        }
        if self.executor.max_attempts == 0 {
            return Err(AgentError::ConfigError("executor.max_attempts must be at least 1".to_string()));
        }
        let s = &self.selector;
        if [s.weight_tags, s.weight_reliability, s.weight_latency]
            .iter()
            .any(|w| *w < 0.0)
        {
            return Err(AgentError::ConfigError("selector weights must be non-negative".to_string()));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
