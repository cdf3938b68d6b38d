//! 引擎：持有共享的连接池、工具缓存、统计与各策略组件，按目标驱动推理循环
//!
//! 由 EngineBuilder 显式构造，由调用方显式 shutdown（落盘缓存、关闭连接、停止后台任务）。
//! 每个目标独享一份 ConversationMemory；连接池与缓存跨目标共享。

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::builder::EngineBuilder;
use crate::core::RecoveryEngine;
use crate::memory::{ConversationMemory, ToolStats};
use crate::react::{
    reasoning_loop, GoalReport, LoopEvent, LoopLimits, ReasoningSession, ResultObserver, TaskPlanner,
};
use crate::tools::{ActionExecutor, ConnectionPool, ToolCache, ToolSelector};

pub struct Engine {
    pub(crate) config: AppConfig,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) cache: ToolCache,
    pub(crate) stats: Arc<ToolStats>,
    pub(crate) selector: ToolSelector,
    pub(crate) executor: ActionExecutor,
    pub(crate) planner: TaskPlanner,
    pub(crate) observer: ResultObserver,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) limits: LoopLimits,
    /// 连接回收、周期落盘等后台任务的停止信号
    pub(crate) background: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &ToolCache {
        &self.cache
    }

    /// 跨目标共享的工具统计
    pub fn stats(&self) -> &Arc<ToolStats> {
        &self.stats
    }

    pub fn limits(&self) -> &LoopLimits {
        &self.limits
    }

    pub fn planner_name(&self) -> &'static str {
        self.planner.strategy_name()
    }

    /// 执行一个目标，直到 Done / Failed
    pub async fn run_goal(&self, goal: &str, cancel: CancellationToken) -> GoalReport {
        self.run_goal_with_events(goal, cancel, None).await
    }

    /// 同 run_goal，并把过程事件推送到 event_tx
    pub async fn run_goal_with_events(
        &self,
        goal: &str,
        cancel: CancellationToken,
        event_tx: Option<&UnboundedSender<LoopEvent>>,
    ) -> GoalReport {
        let mut memory = ConversationMemory::new(self.config.app.max_context_turns);
        let mut session = ReasoningSession::new(
            &self.planner,
            &self.selector,
            &self.executor,
            &self.observer,
            &self.recovery,
            &self.limits,
            cancel,
        );
        if let Some(tx) = event_tx {
            session = session.with_event_tx(tx);
        }
        reasoning_loop(&session, &mut memory, goal)
            .instrument(tracing::info_span!("goal", goal = %goal))
            .await
    }

    /// 停止后台任务、落盘工具缓存、关闭所有空闲连接
    ///
    /// 借出中的连接在归还时会因连接池已关闭而被直接关闭。
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.background.cancel();
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task ended abnormally: {}", e);
            }
        }
        let persisted = self.cache.persist().await;
        self.pool.shutdown().await;
        let persisted = persisted?;
        tracing::info!(cache_entries = persisted, "engine shut down");
        Ok(())
    }
}
