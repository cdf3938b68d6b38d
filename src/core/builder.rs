//! Engine 构建器：由配置装配连接池、缓存、选择器、执行器与规划器
//!
//! 测试与嵌入方可以注入自己的工具服务端连接器、LLM、规划 / 排序策略与缓存后端。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, CacheBackend, StrategyKind};
use crate::core::orchestrator::Engine;
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::ToolStats;
use crate::react::{LlmPlanner, LoopLimits, PlanStrategy, ResultObserver, RulePlanner, TaskPlanner};
use crate::tools::{
    connector_for, ActionExecutor, CacheStore, ConnectionPool, Connector, JsonDirStore, LlmRanker, MockToolServer,
    PoolConfig, RuleRanker, SqliteStore, ToolCache, ToolRanker, ToolSelector,
};

/// 根据配置选择 LLM 后端；provider = none 时不创建
pub(crate) fn create_llm_from_config(cfg: &AppConfig) -> Option<Arc<dyn LlmClient>> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "openai" => {
            let api_key = cfg
                .llm
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
            if api_key.is_none() {
                tracing::warn!("llm.provider = openai but no API key configured, requests will likely fail");
            }
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Some(Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                api_key.as_deref(),
                Duration::from_secs(cfg.llm.request_timeout_secs),
            )))
        }
        "mock" => {
            tracing::info!("Using Mock LLM");
            Some(Arc::new(MockLlmClient::new()))
        }
        _ => None,
    }
}

pub struct EngineBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    connectors: Vec<(String, Arc<dyn Connector>)>,
    planner: Option<Box<dyn PlanStrategy>>,
    ranker: Option<Box<dyn ToolRanker>>,
    store: Option<Arc<dyn CacheStore>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            connectors: Vec::new(),
            planner: None,
            ranker: None,
            store: None,
        }
    }

    /// 覆盖配置中的 LLM 后端
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 额外的工具服务端（不经配置里的 [[servers]]）
    pub fn with_connector(mut self, server_id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.connectors.push((server_id.into(), connector));
        self
    }

    pub fn with_mock_server(self, server: MockToolServer) -> Self {
        let id = server.id().to_string();
        self.with_connector(id, Arc::new(server))
    }

    pub fn with_planner(mut self, strategy: Box<dyn PlanStrategy>) -> Self {
        self.planner = Some(strategy);
        self
    }

    pub fn with_ranker(mut self, ranker: Box<dyn ToolRanker>) -> Self {
        self.ranker = Some(ranker);
        self
    }

    /// 覆盖配置中的缓存持久化后端
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn open_store(&self) -> Result<Option<Arc<dyn CacheStore>>, AgentError> {
        if let Some(store) = &self.store {
            return Ok(Some(Arc::clone(store)));
        }
        let path = self.config.cache.resolved_path();
        match self.config.cache.backend {
            CacheBackend::None => Ok(None),
            CacheBackend::Json => Ok(Some(Arc::new(JsonDirStore::new(path)))),
            CacheBackend::Sqlite => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| AgentError::Persistence(e.to_string()))?;
                }
                let store = SqliteStore::open(&path).map_err(|e| AgentError::Persistence(e.to_string()))?;
                Ok(Some(Arc::new(store)))
            }
        }
    }

    pub async fn build(self) -> Result<Engine, AgentError> {
        self.config.validate()?;
        let config = self.config.clone();
        let llm = self.llm.clone().or_else(|| create_llm_from_config(&config));
        let store = self.open_store()?;

        let mut pool = ConnectionPool::new(PoolConfig::from(&config.pool));
        for entry in &config.servers {
            pool = pool.with_server(entry.id.clone(), connector_for(entry)?);
        }
        for (id, connector) in self.connectors {
            pool = pool.with_server(id, connector);
        }
        let pool = Arc::new(pool);
        if pool.server_ids().is_empty() {
            tracing::warn!("no tool servers configured");
        }

        let cache = match &store {
            Some(store) => ToolCache::with_store(Arc::clone(&pool), (&config.cache).into(), Arc::clone(store)),
            None => ToolCache::new(Arc::clone(&pool), (&config.cache).into()),
        };
        if let Err(e) = cache.load().await {
            tracing::warn!("tool cache warm-up failed: {}", e);
        }

        let stats = Arc::new(ToolStats::default());

        let ranker: Box<dyn ToolRanker> = match (self.ranker, config.selector.ranker, &llm) {
            (Some(ranker), _, _) => ranker,
            (None, StrategyKind::Llm, Some(llm)) => Box::new(LlmRanker::new(Arc::clone(llm))),
            (None, StrategyKind::Llm, None) => {
                tracing::warn!("selector.ranker = llm but no LLM configured, using rule ranking");
                Box::new(RuleRanker)
            }
            (None, StrategyKind::Rule, _) => Box::new(RuleRanker),
        };
        let strategy: Box<dyn PlanStrategy> = match (self.planner, config.engine.planner, &llm) {
            (Some(strategy), _, _) => strategy,
            (None, StrategyKind::Llm, Some(llm)) => Box::new(LlmPlanner::new(Arc::clone(llm))),
            (None, StrategyKind::Llm, None) => {
                tracing::warn!("engine.planner = llm but no LLM configured, using rule planning");
                Box::new(RulePlanner)
            }
            (None, StrategyKind::Rule, _) => Box::new(RulePlanner),
        };

        let selector = ToolSelector::new(cache.clone(), Arc::clone(&stats), ranker, (&config.selector).into());
        let executor = ActionExecutor::new(Arc::clone(&pool), Arc::clone(&stats), (&config.executor).into());
        let planner = TaskPlanner::new(strategy);
        let observer = ResultObserver::new(config.engine.max_step_attempts);
        let limits = LoopLimits::from(&config.engine);

        let background = CancellationToken::new();
        let mut tasks = Vec::new();
        if config.engine.reaper_interval_secs > 0 {
            tasks.push(pool.spawn_reaper(
                Duration::from_secs(config.engine.reaper_interval_secs),
                background.child_token(),
            ));
        }
        if store.is_some() && config.cache.persist_interval_secs > 0 {
            tasks.push(cache.spawn_persist(
                Duration::from_secs(config.cache.persist_interval_secs),
                background.child_token(),
            ));
        }

        tracing::info!(
            servers = pool.server_ids().len(),
            planner = planner.strategy_name(),
            ranker = selector.ranker_name(),
            "engine ready"
        );

        Ok(Engine {
            config,
            pool,
            cache,
            stats,
            selector,
            executor,
            planner,
            observer,
            recovery: RecoveryEngine::new(),
            limits,
            background,
            tasks: Mutex::new(tasks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerEntry;
    use crate::tools::ToolResponse;

    fn quiet_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.cache.backend = CacheBackend::None;
        cfg
    }

    #[test]
    fn test_llm_none_by_default() {
        assert!(create_llm_from_config(&AppConfig::default()).is_none());
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "Mock".into();
        assert!(create_llm_from_config(&cfg).is_some());
    }

    #[tokio::test]
    async fn test_build_with_mock_server() {
        let server = MockToolServer::new("mock").tool("echo", &["echo"], |args| ToolResponse::success(args.clone()));
        let engine = EngineBuilder::new(quiet_config())
            .with_mock_server(server)
            .build()
            .await
            .unwrap();
        assert_eq!(engine.pool().server_ids(), vec!["mock".to_string()]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_build_rejects_stdio_without_command() {
        let mut cfg = quiet_config();
        cfg.servers.push(ServerEntry {
            id: "broken".into(),
            ..Default::default()
        });
        assert!(matches!(
            EngineBuilder::new(cfg).build().await,
            Err(AgentError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_llm_strategies_fall_back_without_llm() {
        let mut cfg = quiet_config();
        cfg.engine.planner = StrategyKind::Llm;
        cfg.selector.ranker = StrategyKind::Llm;
        let engine = EngineBuilder::new(cfg).build().await.unwrap();
        assert_eq!(engine.planner_name(), "rule");
        engine.shutdown().await.unwrap();
    }
}
