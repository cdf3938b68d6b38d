//! 任务规划：把目标拆成带依赖的步骤，执行中途可重新规划
//!
//! PlanStrategy 两种实现：
//! - RulePlanner：按编号列表 / 换行 / 分号 / then / 然后 拆成顺序步骤，按分词匹配能力标签
//! - LlmPlanner：要求模型按 JSON Schema（schemars 生成）输出计划
//!
//! TaskPlanner 持有一个主策略；主策略是 LLM 时，出错（含计划校验失败）统一在这里回退到规则策略。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::{extract_json, LlmClient};
use crate::memory::tokenizer::tokenize;
use crate::memory::Message;
use crate::react::task::{Complexity, SuccessCriteria, TaskContext, TaskStep};

/// 触发重新规划的新观察
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    /// 选择器找不到满足标签的工具
    NoMatch { step_id: String, reason: String },
    StepFailed { step_id: String, error: String },
}

impl Observation {
    pub fn step_id(&self) -> &str {
        match self {
            Observation::NoMatch { step_id, .. }
            | Observation::StepFailed { step_id, .. } => step_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplanOutcome {
    Unchanged,
    Revised(TaskContext),
    /// 目标已经达成，无需继续
    GoalSatisfied,
}

/// 规划策略
#[async_trait]
pub trait PlanStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn plan(&self, goal: &str, available_capabilities: &[String]) -> Result<TaskContext, AgentError>;

    /// memory_context：ConversationMemory::relevant_context 的输出
    async fn replan(
        &self,
        context: &TaskContext,
        observation: &Observation,
        memory_context: &str,
    ) -> Result<ReplanOutcome, AgentError>;
}

// ---------------------------------------------------------------------------
// RulePlanner

fn clause_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s*(?:\n+|;|；|,?\s*\band then\b|,?\s*\bthen\b|，?然后)\s*").expect("valid separator regex")
    })
}

fn list_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:\d+\s*[.)、]|[-*•])\s*").expect("valid list marker regex"))
}

/// 把目标拆成子句：去掉列表编号与首尾标点
pub fn split_goal(goal: &str) -> Vec<String> {
    clause_separator()
        .split(goal)
        .map(|c| list_marker().replace(c, "").into_owned())
        .map(|c| {
            c.trim()
                .trim_matches(|ch: char| matches!(ch, ',' | '.' | '，' | '。' | '!' | '！'))
                .trim()
                .to_string()
        })
        .filter(|c| !c.is_empty())
        .collect()
}

/// 子句里内嵌的 JSON 对象作为步骤参数，其余文字作为描述
fn split_arguments(clause: &str) -> (String, Value) {
    if let (Some(start), Some(end)) = (clause.find('{'), clause.rfind('}')) {
        if end > start {
            if let Ok(args @ Value::Object(_)) = serde_json::from_str::<Value>(&clause[start..=end]) {
                let description = format!("{} {}", &clause[..start], &clause[end + 1..]);
                return (description.split_whitespace().collect::<Vec<_>>().join(" "), args);
            }
        }
    }
    (clause.to_string(), Value::Object(Default::default()))
}

/// 规则规划器：顺序步骤，s1 → s2 → …
#[derive(Debug, Default)]
pub struct RulePlanner;

impl RulePlanner {
    fn infer_capabilities(description: &str, available: &HashSet<String>) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for token in tokenize(description) {
            if available.contains(&token) && !tags.contains(&token) {
                tags.push(token);
            }
        }
        tags
    }
}

#[async_trait]
impl PlanStrategy for RulePlanner {
    fn name(&self) -> &'static str {
        "rule"
    }

    async fn plan(&self, goal: &str, available_capabilities: &[String]) -> Result<TaskContext, AgentError> {
        let available: HashSet<String> = available_capabilities.iter().map(|c| c.to_lowercase()).collect();
        let steps: Vec<TaskStep> = split_goal(goal)
            .iter()
            .enumerate()
            .map(|(i, clause)| {
                let (description, arguments) = split_arguments(clause);
                let mut step = TaskStep::new(format!("s{}", i + 1), description.clone())
                    .with_capabilities(Self::infer_capabilities(&description, &available))
                    .with_arguments(arguments);
                if i > 0 {
                    step = step.depends_on([format!("s{i}")]);
                }
                step
            })
            .collect();
        let complexity = Complexity::estimate(steps.len());
        TaskContext::new(goal, steps, complexity)
    }

    /// 找不到工具时去掉该步骤的标签要求（选择器改按描述相似度匹配）；其他观察不改计划
    async fn replan(
        &self,
        context: &TaskContext,
        observation: &Observation,
        _memory_context: &str,
    ) -> Result<ReplanOutcome, AgentError> {
        let Observation::NoMatch { step_id, .. } = observation else {
            return Ok(ReplanOutcome::Unchanged);
        };
        let Some(step) = context.step(step_id) else {
            return Ok(ReplanOutcome::Unchanged);
        };
        if step.capabilities.is_empty() {
            return Ok(ReplanOutcome::Unchanged);
        }
        let steps = context
            .steps
            .iter()
            .map(|s| {
                let mut s = s.clone();
                if s.id == *step_id {
                    s.capabilities.clear();
                }
                s
            })
            .collect();
        Ok(ReplanOutcome::Revised(context.revise(steps, context.complexity)?))
    }
}

// ---------------------------------------------------------------------------
// LlmPlanner

/// 模型输出的步骤
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PlannedStep {
    /// 步骤 id，计划内唯一，如 "s1"
    pub id: String,
    pub description: String,
    /// 前置步骤 id
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 需要的能力标签，只能取自给出的可用标签
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 传给工具的参数对象
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub success: Option<SuccessCriteria>,
}

impl From<PlannedStep> for TaskStep {
    fn from(p: PlannedStep) -> Self {
        let mut step = TaskStep::new(p.id, p.description)
            .depends_on(p.depends_on)
            .with_capabilities(p.capabilities);
        if let Some(args) = p.arguments {
            step = step.with_arguments(args);
        }
        if let Some(success) = p.success {
            step = step.with_success(success);
        }
        step
    }
}

/// 模型输出的计划
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PlannedTask {
    pub complexity: Option<Complexity>,
    pub steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReplanDecision {
    Unchanged,
    Revise,
    GoalSatisfied,
}

/// 模型输出的重新规划结果；decision = revise 时 steps 为完整的新步骤列表
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PlannedRevision {
    pub decision: ReplanDecision,
    #[serde(default)]
    pub steps: Vec<PlannedStep>,
    pub complexity: Option<Complexity>,
}

fn schema_json<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}

fn parse_reply<T: for<'de> Deserialize<'de>>(reply: &str) -> Result<T, AgentError> {
    let json = extract_json(reply)
        .ok_or_else(|| AgentError::JsonParseError(format!("no JSON object in reply: {reply}")))?;
    serde_json::from_str(json).map_err(|e| AgentError::JsonParseError(format!("{e}: {json}")))
}

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn ask(&self, system: String, user: String) -> Result<String, AgentError> {
        self.llm
            .complete(&[Message::system(system), Message::user(user)])
            .await
            .map_err(AgentError::LlmError)
    }
}

#[async_trait]
impl PlanStrategy for LlmPlanner {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn plan(&self, goal: &str, available_capabilities: &[String]) -> Result<TaskContext, AgentError> {
        let system = format!(
            "Break the user's goal into the smallest set of tool-executable steps. \
             Use only these capability tags: [{}]. \
             Reply with one JSON object matching this schema:\n{}",
            available_capabilities.join(", "),
            schema_json::<PlannedTask>()
        );
        let reply = self.ask(system, format!("Goal: {goal}")).await?;
        let planned: PlannedTask = parse_reply(&reply)?;
        let steps: Vec<TaskStep> = planned.steps.into_iter().map(TaskStep::from).collect();
        let complexity = planned.complexity.unwrap_or_else(|| Complexity::estimate(steps.len()));
        TaskContext::new(goal, steps, complexity)
    }

    async fn replan(
        &self,
        context: &TaskContext,
        observation: &Observation,
        memory_context: &str,
    ) -> Result<ReplanOutcome, AgentError> {
        let system = format!(
            "You maintain a task plan. Given the current plan and a new observation, decide whether \
             to keep it (unchanged), replace the remaining steps (revise, give the full step list; \
             completed steps keep their ids), or stop because the goal is met (goal_satisfied). \
             Reply with one JSON object matching this schema:\n{}",
            schema_json::<PlannedRevision>()
        );
        let plan = serde_json::to_string_pretty(context)
            .map_err(|e| AgentError::JsonParseError(e.to_string()))?;
        let observation = serde_json::to_string(observation)
            .map_err(|e| AgentError::JsonParseError(e.to_string()))?;
        let user = format!("Plan:\n{plan}\n\nObservation:\n{observation}\n\nContext:\n{memory_context}");

        let revision: PlannedRevision = parse_reply(&self.ask(system, user).await?)?;
        match revision.decision {
            ReplanDecision::Unchanged => Ok(ReplanOutcome::Unchanged),
            ReplanDecision::GoalSatisfied => Ok(ReplanOutcome::GoalSatisfied),
            ReplanDecision::Revise => {
                let steps: Vec<TaskStep> = revision.steps.into_iter().map(TaskStep::from).collect();
                let complexity = revision.complexity.unwrap_or(context.complexity);
                Ok(ReplanOutcome::Revised(context.revise(steps, complexity)?))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TaskPlanner

/// 规划入口：主策略 + 规则回退
pub struct TaskPlanner {
    primary: Box<dyn PlanStrategy>,
    fallback: RulePlanner,
}

impl TaskPlanner {
    pub fn new(primary: Box<dyn PlanStrategy>) -> Self {
        Self {
            primary,
            fallback: RulePlanner,
        }
    }

    pub fn rule_based() -> Self {
        Self::new(Box::new(RulePlanner))
    }

    pub fn strategy_name(&self) -> &'static str {
        self.primary.name()
    }

    pub async fn plan(&self, goal: &str, available_capabilities: &[String]) -> Result<TaskContext, AgentError> {
        match self.primary.plan(goal, available_capabilities).await {
            Ok(ctx) => {
                tracing::info!(
                    planner = self.primary.name(),
                    steps = ctx.steps.len(),
                    complexity = ?ctx.complexity,
                    "plan created"
                );
                Ok(ctx)
            }
            Err(e) if self.primary.name() != self.fallback.name() => {
                tracing::warn!(planner = self.primary.name(), error = %e, "planning failed, falling back to rules");
                self.fallback.plan(goal, available_capabilities).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn replan(
        &self,
        context: &TaskContext,
        observation: &Observation,
        memory_context: &str,
    ) -> Result<ReplanOutcome, AgentError> {
        match self.primary.replan(context, observation, memory_context).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if self.primary.name() != self.fallback.name() => {
                tracing::warn!(planner = self.primary.name(), error = %e, "replanning failed, falling back to rules");
                self.fallback.replan(context, observation, memory_context).await
            }
            Err(e) => Err(e),
        }
    }
}
