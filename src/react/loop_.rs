//! 推理主循环
//!
//! Planning -> {Selecting -> Acting -> Observing}* -> Done | Failed。
//! 每轮取一个 Ready 步骤：选工具、执行、观察；找不到工具或步骤失败时按 RecoveryEngine 的决策
//! 重新规划 / 记为失败 / 终止。迭代预算、墙钟期限与取消在每轮开始和每次等待时检查。
//! 可选 event_tx：推送 LoopEvent。

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSection;
use crate::core::{AgentError, BudgetKind, LoopPhase, RecoveryAction, RecoveryEngine};
use crate::memory::ConversationMemory;
use crate::react::events::LoopEvent;
use crate::react::observer::{preview, ResultObserver, Verdict};
use crate::react::planner::{Observation, ReplanOutcome, TaskPlanner};
use crate::react::task::{Action, Complexity, ReasoningStep, TaskContext, TaskStep};
use crate::tools::{ActionExecutor, Selection, ToolSelector};

/// 单个目标的迭代 / 时间 / 重新规划上限
#[derive(Debug, Clone)]
pub struct LoopLimits {
    pub max_iterations: usize,
    pub simple_budget: usize,
    pub moderate_budget: usize,
    pub complex_budget: usize,
    pub deadline: Duration,
    pub max_replans_per_step: u32,
}

impl LoopLimits {
    /// 迭代预算 = min(max_iterations, 复杂度对应预算)
    pub fn budget_for(&self, complexity: Complexity) -> usize {
        let by_complexity = match complexity {
            Complexity::Simple => self.simple_budget,
            Complexity::Moderate => self.moderate_budget,
            Complexity::Complex => self.complex_budget,
        };
        self.max_iterations.min(by_complexity).max(1)
    }
}

impl From<&EngineSection> for LoopLimits {
    fn from(s: &EngineSection) -> Self {
        Self {
            max_iterations: s.max_iterations,
            simple_budget: s.simple_budget,
            moderate_budget: s.moderate_budget,
            complex_budget: s.complex_budget,
            deadline: Duration::from_millis(s.deadline_ms),
            max_replans_per_step: s.max_replans_per_step,
        }
    }
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

/// 目标的结局
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GoalOutcome {
    Done,
    Failed {
        #[serde(serialize_with = "error_as_string")]
        error: AgentError,
        /// 导致失败的步骤（规划失败、取消等没有对应步骤时为 None）
        step_id: Option<String>,
    },
}

fn error_as_string<S: Serializer>(error: &AgentError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// 一次 run_goal 的完整报告
#[derive(Debug, Clone, Serialize)]
pub struct GoalReport {
    pub goal: String,
    pub outcome: GoalOutcome,
    pub iterations: usize,
    pub budget: usize,
    /// 规划失败时为 None
    pub context: Option<TaskContext>,
    pub reasoning: Vec<ReasoningStep>,
    /// 最后一个完成步骤的输出
    pub output: Option<Value>,
    pub elapsed_ms: u64,
}

impl GoalReport {
    pub fn is_done(&self) -> bool {
        self.outcome == GoalOutcome::Done
    }

    pub fn error(&self) -> Option<&AgentError> {
        match &self.outcome {
            GoalOutcome::Done => None,
            GoalOutcome::Failed { error, .. } => Some(error),
        }
    }
}

/// 推理循环所需的组件（均由 Engine 持有）
pub struct ReasoningSession<'a> {
    pub planner: &'a TaskPlanner,
    pub selector: &'a ToolSelector,
    pub executor: &'a ActionExecutor,
    pub observer: &'a ResultObserver,
    pub recovery: &'a RecoveryEngine,
    pub limits: &'a LoopLimits,
    pub cancel_token: CancellationToken,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<LoopEvent>>,
}

impl<'a> ReasoningSession<'a> {
    pub fn new(
        planner: &'a TaskPlanner,
        selector: &'a ToolSelector,
        executor: &'a ActionExecutor,
        observer: &'a ResultObserver,
        recovery: &'a RecoveryEngine,
        limits: &'a LoopLimits,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            planner,
            selector,
            executor,
            observer,
            recovery,
            limits,
            cancel_token,
            event_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

fn send_event(tx: Option<&UnboundedSender<LoopEvent>>, ev: LoopEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 失败原因与相关步骤
type Failure = (AgentError, Option<String>);

/// 恢复之后循环如何继续
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Planner 判定目标已达成
    Finish,
}

/// 等待 fut，同时响应取消与墙钟期限
async fn guarded<T>(
    cancel: &CancellationToken,
    deadline: Instant,
    limit: Duration,
    fut: impl Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(AgentError::BudgetExceeded(BudgetKind::Deadline(limit))),
        r = fut => r,
    }
}

struct Run<'s, 'a> {
    session: &'s ReasoningSession<'a>,
    phase: LoopPhase,
    deadline: Instant,
    budget: usize,
    iterations: usize,
    reasoning: Vec<ReasoningStep>,
    replans: HashMap<String, u32>,
    step_errors: HashMap<String, AgentError>,
    output: Option<Value>,
    tool_calls: Vec<String>,
}

impl<'s, 'a> Run<'s, 'a> {
    fn new(session: &'s ReasoningSession<'a>) -> Self {
        Self {
            session,
            phase: LoopPhase::Idle,
            deadline: Instant::now() + session.limits.deadline,
            budget: session.limits.max_iterations,
            iterations: 0,
            reasoning: Vec::new(),
            replans: HashMap::new(),
            step_errors: HashMap::new(),
            output: None,
            tool_calls: Vec::new(),
        }
    }

    fn emit(&self, ev: LoopEvent) {
        send_event(self.session.event_tx, ev);
    }

    fn enter(&mut self, next: LoopPhase) -> Result<(), Failure> {
        self.phase = self.phase.transition(next).map_err(|e| (e, None))?;
        tracing::debug!(phase = ?next, iteration = self.iterations, "loop phase");
        self.emit(LoopEvent::Phase { phase: next });
        Ok(())
    }

    async fn guard<T>(&self, fut: impl Future<Output = Result<T, AgentError>>) -> Result<T, AgentError> {
        guarded(&self.session.cancel_token, self.deadline, self.session.limits.deadline, fut).await
    }

    /// 失败步骤对应的错误：优先取循环里记下的带类型错误
    fn step_error(&self, step: &TaskStep) -> AgentError {
        self.step_errors.get(&step.id).cloned().unwrap_or_else(|| AgentError::ToolExecution {
            tool: step.id.clone(),
            message: step.error.clone().unwrap_or_else(|| "step failed".to_string()),
        })
    }

    async fn drive(
        &mut self,
        memory: &mut ConversationMemory,
        goal: &str,
        slot: &mut Option<TaskContext>,
    ) -> Result<(), Failure> {
        let session = self.session;
        self.enter(LoopPhase::Planning)?;

        let capabilities = match self.guard(session.selector.available_capabilities()).await {
            Ok(c) => c,
            Err(e @ (AgentError::Cancelled | AgentError::BudgetExceeded(_))) => return Err((e, None)),
            Err(e) => {
                tracing::warn!(error = %e, "no capability tags available for planning");
                Vec::new()
            }
        };
        let planned = self
            .guard(session.planner.plan(goal, &capabilities))
            .await
            .map_err(|e| (e, None))?;
        self.budget = session.limits.budget_for(planned.complexity);
        self.emit(LoopEvent::Planned {
            steps: planned.steps.len(),
            budget: self.budget,
        });
        tracing::info!(goal = %goal, steps = planned.steps.len(), budget = self.budget, "goal planned");
        let ctx = slot.insert(planned);

        loop {
            if ctx.is_complete() {
                return Ok(());
            }
            if session.cancel_token.is_cancelled() {
                return Err((AgentError::Cancelled, None));
            }
            if Instant::now() >= self.deadline {
                return Err((AgentError::BudgetExceeded(BudgetKind::Deadline(session.limits.deadline)), None));
            }
            let Some(step) = ctx.next_ready().cloned() else {
                // 没有可推进的步骤：有失败步骤就是被它阻塞
                return match ctx.first_failed() {
                    Some(failed) => Err((self.step_error(failed), Some(failed.id.clone()))),
                    None => Ok(()),
                };
            };
            if self.iterations >= self.budget {
                return Err((
                    AgentError::BudgetExceeded(BudgetKind::Iterations(self.iterations)),
                    Some(step.id),
                ));
            }

            self.iterations += 1;
            let iteration = self.iterations;
            self.emit(LoopEvent::Iteration {
                iteration,
                budget: self.budget,
                step: step.id.clone(),
            });
            self.enter(LoopPhase::Selecting)?;

            let selection = self
                .guard(session.selector.select(&step.description, &step.capabilities))
                .await;
            let chosen = match selection {
                Ok(Selection::Tool(chosen)) => chosen,
                Ok(Selection::NoMatch { reason }) => {
                    memory.add_turn(&step.description, format!("no tool: {reason}"), Vec::new());
                    let err = AgentError::NoMatchingTool(format!("step '{}': {reason}", step.id));
                    match self.recover(err, &step.id, ctx, memory, goal).await? {
                        Flow::Finish => return Ok(()),
                        Flow::Continue => continue,
                    }
                }
                Err(e) => {
                    memory.add_turn(&step.description, format!("selection failed: {e}"), Vec::new());
                    match self.recover(e, &step.id, ctx, memory, goal).await? {
                        Flow::Finish => return Ok(()),
                        Flow::Continue => continue,
                    }
                }
            };

            self.enter(LoopPhase::Acting)?;
            ctx.start_step(&step.id).map_err(|e| (e, Some(step.id.clone())))?;
            let descriptor = &chosen.descriptor;
            let key = descriptor.key();
            let action = Action::Tool {
                server: descriptor.server_id.clone(),
                tool: descriptor.name.clone(),
                arguments: step.arguments.clone(),
            };
            let thought = format!(
                "step '{}' ({}): use {} (score {:.2})",
                step.id, step.description, key, chosen.score
            );
            self.emit(LoopEvent::ToolCall {
                step: step.id.clone(),
                tool: key.clone(),
                args: step.arguments.clone(),
            });
            let call_id = format!("{key}#{iteration}");
            self.tool_calls.push(call_id.clone());

            let started = std::time::Instant::now();
            let executed = self
                .guard(session.executor.execute(descriptor, step.arguments.clone(), &session.cancel_token))
                .await;
            let result = match executed {
                Ok(r) => r,
                Err(e) => {
                    memory.record_tool_usage(&key, false, started.elapsed());
                    memory.add_turn(&step.description, format!("{key} error: {e}"), vec![call_id]);
                    self.reasoning.push(ReasoningStep {
                        iteration,
                        thought,
                        action,
                        observation: format!("error: {e}"),
                        confidence: 0.0,
                    });
                    match self.recover(e, &step.id, ctx, memory, goal).await? {
                        Flow::Finish => return Ok(()),
                        Flow::Continue => continue,
                    }
                }
            };
            memory.record_tool_usage(&key, result.success, Duration::from_millis(result.elapsed_ms));
            let observed = match (&result.output, &result.error) {
                (_, Some(err)) => format!("{key} failed: {err}"),
                (Some(v), None) => format!("{key}: {}", preview(v)),
                (None, None) => format!("{key}: no output"),
            };
            memory.add_turn(&step.description, observed, vec![call_id]);

            self.enter(LoopPhase::Observing)?;
            self.emit(LoopEvent::Observation {
                step: step.id.clone(),
                tool: key.clone(),
                preview: result.output.as_ref().map(preview).unwrap_or_default(),
            });
            let verdict = session
                .observer
                .observe(ctx, &step.id, action, &result, iteration, thought, &mut self.reasoning)
                .map_err(|e| (e, Some(step.id.clone())))?;

            match verdict {
                Verdict::GoalComplete => {
                    self.output = result.output;
                    return Ok(());
                }
                Verdict::StepDone => self.output = result.output,
                Verdict::ContinueStep => {}
                Verdict::StepFailed(reason) => {
                    let err = AgentError::ToolExecution {
                        tool: key,
                        message: reason.clone(),
                    };
                    self.step_errors.insert(step.id.clone(), err);
                    self.emit(LoopEvent::StepFailed {
                        step: step.id.clone(),
                        reason: reason.clone(),
                    });
                    let observation = Observation::StepFailed {
                        step_id: step.id.clone(),
                        error: reason,
                    };
                    if self.replan(ctx, observation, memory, goal).await? == Some(Flow::Finish) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// 按 RecoveryEngine 的决策处理错误
    async fn recover(
        &mut self,
        err: AgentError,
        step_id: &str,
        ctx: &mut TaskContext,
        memory: &mut ConversationMemory,
        goal: &str,
    ) -> Result<Flow, Failure> {
        let action = self.session.recovery.handle(&err);
        tracing::info!(step = step_id, action = ?action, error = %err, "recovering");
        self.emit(LoopEvent::Recovery {
            action: format!("{action:?}").to_lowercase(),
            detail: err.to_string(),
        });

        match action {
            RecoveryAction::Replan => {
                let observation = Observation::NoMatch {
                    step_id: step_id.to_string(),
                    reason: err.to_string(),
                };
                match self.replan(ctx, observation, memory, goal).await? {
                    Some(flow) => Ok(flow),
                    None => Err((err, Some(step_id.to_string()))),
                }
            }
            RecoveryAction::FailStep => {
                if ctx.step(step_id).is_some_and(|s| !s.is_terminal()) {
                    ctx.fail_step(step_id, err.to_string())
                        .map_err(|e| (e, Some(step_id.to_string())))?;
                }
                self.step_errors.insert(step_id.to_string(), err.clone());
                self.emit(LoopEvent::StepFailed {
                    step: step_id.to_string(),
                    reason: err.to_string(),
                });
                let observation = Observation::StepFailed {
                    step_id: step_id.to_string(),
                    error: err.to_string(),
                };
                Ok(self.replan(ctx, observation, memory, goal).await?.unwrap_or(Flow::Continue))
            }
            RecoveryAction::Abort => {
                if ctx.step(step_id).is_some_and(|s| !s.is_terminal()) {
                    let _ = ctx.fail_step(step_id, err.to_string());
                }
                Err((err, Some(step_id.to_string())))
            }
        }
    }

    /// 交给 Planner 重新规划；None 表示计划未变或该步骤的重新规划次数已用完
    async fn replan(
        &mut self,
        ctx: &mut TaskContext,
        observation: Observation,
        memory: &mut ConversationMemory,
        goal: &str,
    ) -> Result<Option<Flow>, Failure> {
        let session = self.session;
        let step_id = observation.step_id().to_string();
        let used = self.replans.entry(step_id.clone()).or_insert(0);
        if *used >= session.limits.max_replans_per_step {
            tracing::debug!(step = %step_id, "replan limit reached");
            return Ok(None);
        }
        *used += 1;

        memory.set_active_context(ctx.clone());
        let memory_context = memory.relevant_context(goal);
        let outcome = self
            .guard(session.planner.replan(ctx, &observation, &memory_context))
            .await
            .map_err(|e| (e, Some(step_id.clone())))?;
        match outcome {
            ReplanOutcome::Unchanged => Ok(None),
            ReplanOutcome::GoalSatisfied => {
                tracing::info!(step = %step_id, "planner reports goal satisfied");
                Ok(Some(Flow::Finish))
            }
            ReplanOutcome::Revised(revised) => {
                tracing::info!(step = %step_id, steps = revised.steps.len(), "plan revised");
                *ctx = revised;
                self.emit(LoopEvent::Planned {
                    steps: ctx.steps.len(),
                    budget: self.budget,
                });
                Ok(Some(Flow::Continue))
            }
        }
    }

    fn summary(&self, outcome: &GoalOutcome) -> String {
        match outcome {
            GoalOutcome::Done => match &self.output {
                Some(v) => preview(v),
                None => "done".to_string(),
            },
            GoalOutcome::Failed { error, .. } => format!("failed: {error}"),
        }
    }
}

/// 执行一个目标直到 Done / Failed
///
/// 循环本身不会 panic 也不会返回 Err：所有失败都体现在 GoalReport.outcome 里。
/// 结束后任务上下文留在 memory 中，并追加一轮对话记录。
pub async fn reasoning_loop(
    session: &ReasoningSession<'_>,
    memory: &mut ConversationMemory,
    goal: &str,
) -> GoalReport {
    let started = std::time::Instant::now();
    let mut run = Run::new(session);
    let mut slot: Option<TaskContext> = None;

    let result = run.drive(memory, goal, &mut slot).await;
    let (outcome, terminal) = match result {
        Ok(()) => {
            if let Some(ctx) = slot.as_mut() {
                ctx.mark_succeeded();
            }
            tracing::info!(goal = %goal, iterations = run.iterations, "goal done");
            send_event(session.event_tx, LoopEvent::Done { iterations: run.iterations });
            (GoalOutcome::Done, LoopPhase::Done)
        }
        Err((error, step_id)) => {
            if let Some(ctx) = slot.as_mut() {
                ctx.mark_failed();
            }
            tracing::warn!(
                goal = %goal,
                iterations = run.iterations,
                step = step_id.as_deref().unwrap_or("-"),
                error = %error,
                "goal failed"
            );
            send_event(
                session.event_tx,
                LoopEvent::Failed {
                    iterations: run.iterations,
                    error: error.to_string(),
                },
            );
            (GoalOutcome::Failed { error, step_id }, LoopPhase::Failed)
        }
    };
    // drive 总是先进入 Planning，终态转换不会失败
    if let Err((e, _)) = run.enter(terminal) {
        tracing::error!(error = %e, "loop ended outside the phase machine");
    }

    memory.add_turn(goal, run.summary(&outcome), run.tool_calls.clone());
    if let Some(ctx) = &slot {
        memory.set_active_context(ctx.clone());
    }

    GoalReport {
        goal: goal.to_string(),
        outcome,
        iterations: run.iterations,
        budget: run.budget,
        context: slot,
        reasoning: run.reasoning,
        output: run.output,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
