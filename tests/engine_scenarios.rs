//! 引擎端到端场景：Mock 工具服务端 + 规则规划器

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bee_hive::config::{AppConfig, CacheBackend};
use bee_hive::core::{AgentError, BudgetKind, Engine};
use bee_hive::react::{
    GoalOutcome, Observation, PlanStrategy, ReplanOutcome, RulePlanner, StepStatus, SuccessCriteria, TaskContext,
    TaskStep,
};
use bee_hive::react::task::Complexity;
use bee_hive::tools::{MockToolServer, ToolResponse};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.cache.backend = CacheBackend::None;
    cfg.engine.reaper_interval_secs = 0;
    cfg.executor.backoff_base_ms = 1;
    cfg.executor.backoff_max_ms = 5;
    cfg
}

/// 固定计划；重新规划沿用规则规划器的做法并计数
struct FixedPlan {
    steps: Vec<TaskStep>,
    replans: Arc<AtomicUsize>,
}

impl FixedPlan {
    fn new(steps: Vec<TaskStep>) -> Self {
        Self {
            steps,
            replans: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl PlanStrategy for FixedPlan {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn plan(&self, goal: &str, _available: &[String]) -> Result<TaskContext, AgentError> {
        let complexity = Complexity::estimate(self.steps.len());
        TaskContext::new(goal, self.steps.clone(), complexity)
    }

    async fn replan(
        &self,
        context: &TaskContext,
        observation: &Observation,
        memory_context: &str,
    ) -> Result<ReplanOutcome, AgentError> {
        self.replans.fetch_add(1, Ordering::SeqCst);
        RulePlanner.replan(context, observation, memory_context).await
    }
}

fn math_server() -> MockToolServer {
    MockToolServer::new("math").tool("add", &["add", "math"], |args| {
        let a = args["a"].as_i64().unwrap_or(0);
        let b = args["b"].as_i64().unwrap_or(0);
        ToolResponse::success(json!(a + b))
    })
}

#[tokio::test]
async fn scenario_a_single_step_done_in_one_iteration() {
    let server = math_server();
    let engine = Engine::builder(test_config())
        .with_mock_server(server.clone())
        .build()
        .await
        .unwrap();

    let report = engine
        .run_goal(r#"add {"a": 2, "b": 3}"#, CancellationToken::new())
        .await;

    assert_eq!(report.outcome, GoalOutcome::Done);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.output, Some(json!(5)));
    assert_eq!(server.call_count("add"), 1);
    assert_eq!(report.reasoning.len(), 1);
    let ctx = report.context.as_ref().unwrap();
    assert_eq!(ctx.steps[0].status, StepStatus::Done);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_b_failed_prerequisite_blocks_dependent_step() {
    let server = MockToolServer::new("web")
        .tool("fetch", &["fetch"], |_| ToolResponse::failure("404 not found"))
        .tool("summarize", &["summarize"], |_| ToolResponse::success(json!("summary")));
    let engine = Engine::builder(test_config())
        .with_mock_server(server.clone())
        .build()
        .await
        .unwrap();

    let report = engine
        .run_goal("fetch the page then summarize it", CancellationToken::new())
        .await;

    match &report.outcome {
        GoalOutcome::Failed { error, step_id } => {
            assert_eq!(step_id.as_deref(), Some("s1"));
            match error {
                AgentError::ToolExecution { tool, message } => {
                    assert_eq!(tool, "web/fetch");
                    assert!(message.contains("404"));
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
        GoalOutcome::Done => panic!("goal should fail"),
    }
    assert_eq!(server.call_count("fetch"), 1);
    assert_eq!(server.call_count("summarize"), 0);
    let ctx = report.context.as_ref().unwrap();
    assert_eq!(ctx.step("s2").unwrap().status, StepStatus::Pending);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_c_no_match_replans_once_then_fails() {
    let plan = FixedPlan::new(vec![TaskStep::new("s1", "send email").with_capabilities(["email"])]);
    let replans = Arc::clone(&plan.replans);
    let engine = Engine::builder(test_config())
        .with_mock_server(math_server())
        .with_planner(Box::new(plan))
        .build()
        .await
        .unwrap();

    let report = engine.run_goal("send email", CancellationToken::new()).await;

    assert!(matches!(
        report.outcome,
        GoalOutcome::Failed { error: AgentError::NoMatchingTool(_), .. }
    ));
    assert_eq!(replans.load(Ordering::SeqCst), 1);
    assert_eq!(report.iterations, 2);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_d_transient_connection_failures_are_absorbed() {
    let server = math_server();
    server.fail_next_calls(2);
    let engine = Engine::builder(test_config())
        .with_mock_server(server.clone())
        .build()
        .await
        .unwrap();

    let report = engine
        .run_goal(r#"add {"a": 1, "b": 1}"#, CancellationToken::new())
        .await;

    assert!(report.is_done(), "{:?}", report.outcome);
    assert_eq!(report.output, Some(json!(2)));
    let step = &report.context.as_ref().unwrap().steps[0];
    assert!(step.error.is_none());
    assert_eq!(step.attempts, 1);
    let usage = engine.stats().get("math/add").unwrap();
    assert_eq!(usage.calls, 1);
    assert_eq!(usage.failures, 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_e_iteration_budget_exhausted_at_exactly_three() {
    let mut cfg = test_config();
    cfg.engine.max_iterations = 3;
    cfg.engine.max_step_attempts = 100;
    let server = MockToolServer::new("jobs").tool("poll", &["poll"], |_| ToolResponse::success(json!("pending")));
    let plan = FixedPlan::new(vec![TaskStep::new("s1", "poll the job")
        .with_capabilities(["poll"])
        .with_success(SuccessCriteria::Contains("finished".into()))]);
    let engine = Engine::builder(cfg)
        .with_mock_server(server.clone())
        .with_planner(Box::new(plan))
        .build()
        .await
        .unwrap();

    let report = engine.run_goal("wait for the job", CancellationToken::new()).await;

    assert_eq!(
        report.error(),
        Some(&AgentError::BudgetExceeded(BudgetKind::Iterations(3)))
    );
    assert_eq!(report.iterations, 3);
    assert_eq!(server.call_count("poll"), 3);
    assert_eq!(report.reasoning.len(), 3);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn steps_never_run_before_prerequisites_are_done() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut server = MockToolServer::new("pipe");
    for name in ["extract", "clean", "index", "publish"] {
        let order = Arc::clone(&order);
        server = server.tool(name, &[name], move |_| {
            order.lock().unwrap().push(name.to_string());
            ToolResponse::success(json!(name))
        });
    }
    let plan = FixedPlan::new(vec![
        TaskStep::new("publish", "publish").depends_on(["clean", "index"]).with_capabilities(["publish"]),
        TaskStep::new("index", "index").depends_on(["extract"]).with_capabilities(["index"]),
        TaskStep::new("clean", "clean").depends_on(["extract"]).with_capabilities(["clean"]),
        TaskStep::new("extract", "extract").with_capabilities(["extract"]),
    ]);
    let engine = Engine::builder(test_config())
        .with_mock_server(server)
        .with_planner(Box::new(plan))
        .build()
        .await
        .unwrap();

    let report = engine.run_goal("run the pipeline", CancellationToken::new()).await;
    assert!(report.is_done(), "{:?}", report.outcome);

    let order = order.lock().unwrap().clone();
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert_eq!(order.len(), 4);
    assert!(pos("extract") < pos("clean"));
    assert!(pos("extract") < pos("index"));
    assert!(pos("clean") < pos("publish"));
    assert!(pos("index") < pos("publish"));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn loop_terminates_within_max_iterations_for_adversarial_goals() {
    let mut cfg = test_config();
    cfg.engine.max_iterations = 5;
    cfg.engine.max_step_attempts = 50;
    let server = MockToolServer::new("flaky")
        .tool("echo", &["echo"], |args| ToolResponse::success(args.clone()))
        .tool("broken", &["broken"], |_| ToolResponse::failure("always broken"));
    let engine = Engine::builder(cfg.clone())
        .with_mock_server(server)
        .build()
        .await
        .unwrap();

    let long_goal = (1..=30).map(|i| format!("echo item {i}")).collect::<Vec<_>>().join(" then ");
    let goals = [
        "",
        "   ;;; then ",
        "broken thing then echo again",
        "something no tool could ever do",
        long_goal.as_str(),
    ];
    for goal in goals {
        let report = engine.run_goal(goal, CancellationToken::new()).await;
        assert!(report.iterations <= cfg.engine.max_iterations, "goal {goal:?}");
        if goal.trim().is_empty() || goal.starts_with("   ;") {
            assert!(matches!(
                report.outcome,
                GoalOutcome::Failed { error: AgentError::InvalidPlan(_), .. }
            ));
        }
    }
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_goals_share_one_discovery_and_respect_pool_cap() {
    let mut cfg = test_config();
    cfg.pool.max_connections_per_server = 2;
    let server = math_server();
    server.set_list_delay(Duration::from_millis(50));
    server.set_call_delay(Duration::from_millis(20));
    let engine = Engine::builder(cfg)
        .with_mock_server(server.clone())
        .build()
        .await
        .unwrap();

    let goals: Vec<String> = (0..6).map(|i| format!(r#"add {{"a": {i}, "b": 1}}"#)).collect();
    let reports = futures_util::future::join_all(
        goals
            .iter()
            .map(|g| engine.run_goal(g, CancellationToken::new())),
    )
    .await;

    assert!(reports.iter().all(|r| r.is_done()));
    assert_eq!(server.list_calls(), 1);
    assert!(engine.pool().peak_checked_out("math") <= 2);
    assert!(server.peak_open() <= 2);
    assert_eq!(server.call_count("add"), 6);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_goal_and_returns_connection() {
    let server = MockToolServer::new("slow").tool("wait", &["wait"], |_| ToolResponse::success(Value::Null));
    server.set_call_delay(Duration::from_secs(30));
    let engine = Engine::builder(test_config())
        .with_mock_server(server.clone())
        .build()
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let report = engine.run_goal("wait", cancel).await;

    assert_eq!(report.error(), Some(&AgentError::Cancelled));
    assert_eq!(engine.pool().checked_out("slow"), 0);
    let ctx = report.context.as_ref().unwrap();
    assert_eq!(ctx.steps[0].status, StepStatus::Failed);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn loop_events_trace_the_phases() {
    let engine = Engine::builder(test_config())
        .with_mock_server(math_server())
        .build()
        .await
        .unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let report = engine
        .run_goal_with_events(r#"add {"a": 1, "b": 2}"#, CancellationToken::new(), Some(&tx))
        .await;
    drop(tx);
    assert!(report.is_done());

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(serde_json::to_value(&ev).unwrap());
    }
    let types: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();
    assert!(types.contains(&"planned"));
    assert!(types.contains(&"tool_call"));
    assert!(types.contains(&"observation"));
    assert_eq!(types.last(), Some(&"phase"));
    assert_eq!(events.last().unwrap()["phase"], "done");
    engine.shutdown().await.unwrap();
}

/// 规则规划，记下每次重新规划时拿到的记忆上下文
struct RecordingPlanner {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PlanStrategy for RecordingPlanner {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn plan(&self, goal: &str, available: &[String]) -> Result<TaskContext, AgentError> {
        RulePlanner.plan(goal, available).await
    }

    async fn replan(
        &self,
        context: &TaskContext,
        observation: &Observation,
        memory_context: &str,
    ) -> Result<ReplanOutcome, AgentError> {
        self.seen.lock().unwrap().push(memory_context.to_string());
        RulePlanner.replan(context, observation, memory_context).await
    }
}

#[tokio::test]
async fn earlier_iterations_reach_the_planner_on_replan() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::builder(test_config())
        .with_mock_server(math_server())
        .with_planner(Box::new(RecordingPlanner { seen: seen.clone() }))
        .build()
        .await
        .unwrap();

    let report = engine
        .run_goal(r#"add {"a": 1, "b": 2} then send email"#, CancellationToken::new())
        .await;
    assert!(matches!(report.error(), Some(AgentError::NoMatchingTool(_))));
    assert_eq!(report.context.as_ref().unwrap().step("s1").unwrap().status, StepStatus::Done);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("Relevant history"), "{}", seen[0]);
    assert!(seen[0].contains("math/add: 3"), "{}", seen[0]);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn deadline_stops_a_slow_tool() {
    let server = MockToolServer::new("slow").tool("wait", &["wait"], |_| ToolResponse::success(Value::Null));
    server.set_call_delay(Duration::from_secs(5));
    let mut cfg = test_config();
    cfg.engine.deadline_ms = 100;
    let engine = Engine::builder(cfg)
        .with_mock_server(server.clone())
        .build()
        .await
        .unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let started = std::time::Instant::now();
    let report = engine
        .run_goal_with_events("wait", CancellationToken::new(), Some(&tx))
        .await;
    drop(tx);

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        report.error(),
        Some(&AgentError::BudgetExceeded(BudgetKind::Deadline(Duration::from_millis(100))))
    );
    assert_eq!(report.context.as_ref().unwrap().steps[0].status, StepStatus::Failed);
    assert_eq!(engine.pool().checked_out("slow"), 0);

    let mut last = None;
    while let Some(ev) = rx.recv().await {
        last = Some(serde_json::to_value(&ev).unwrap());
    }
    let last = last.unwrap();
    assert_eq!(last["type"], "phase");
    assert_eq!(last["phase"], "failed");
    engine.shutdown().await.unwrap();
}
