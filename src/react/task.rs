//! 任务上下文：一个目标对应一个 TaskContext，内含带依赖的步骤列表
//!
//! 步骤状态机：Pending → Ready → Running → Done | Failed（Running 可退回 Ready 重试）。
//! 只有全部前置步骤 Done 时才能进入 Running；失败的步骤阻塞依赖它的步骤，不影响独立步骤。

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

/// 复杂度估计，仅用于确定迭代预算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    /// 按步骤数粗估
    pub fn estimate(step_count: usize) -> Self {
        match step_count {
            0 | 1 => Complexity::Simple,
            2 | 3 => Complexity::Moderate,
            _ => Complexity::Complex,
        }
    }
}

/// 步骤的成功判定；默认任何未报错的结果都算成功
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SuccessCriteria {
    #[default]
    Any,
    /// 输出非 null、非空串、非空数组 / 对象
    NonEmpty,
    /// 输出的文本形式包含给定子串
    Contains(String),
    JsonObject,
    /// 输出是对象且包含全部字段
    JsonFields(Vec<String>),
}

impl SuccessCriteria {
    pub fn is_met(&self, output: &Value) -> bool {
        match self {
            SuccessCriteria::Any => true,
            SuccessCriteria::NonEmpty => match output {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            },
            SuccessCriteria::Contains(needle) => match output {
                Value::String(s) => s.contains(needle.as_str()),
                other => other.to_string().contains(needle.as_str()),
            },
            SuccessCriteria::JsonObject => output.is_object(),
            SuccessCriteria::JsonFields(fields) => output
                .as_object()
                .map(|o| fields.iter().all(|f| o.contains_key(f)))
                .unwrap_or(false),
        }
    }
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 需要的能力标签（小写）
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub success: SuccessCriteria,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl TaskStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            depends_on: Vec::new(),
            capabilities: Vec::new(),
            arguments: Value::Object(Default::default()),
            success: SuccessCriteria::Any,
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
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

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_success(mut self, success: SuccessCriteria) -> Self {
        self.success = success;
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StepStatus::Done | StepStatus::Failed)
    }
}

/// 一个目标的任务上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub id: String,
    pub goal: String,
    pub status: TaskStatus,
    pub steps: Vec<TaskStep>,
    pub complexity: Complexity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskContext {
    /// 校验步骤图并计算初始 Ready 集合
    pub fn new(goal: impl Into<String>, steps: Vec<TaskStep>, complexity: Complexity) -> Result<Self, AgentError> {
        let now = Utc::now();
        let mut ctx = Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            status: TaskStatus::Pending,
            steps,
            complexity,
            created_at: now,
            updated_at: now,
        };
        ctx.validate()?;
        ctx.refresh_ready();
        Ok(ctx)
    }

    /// 用新的步骤列表修订计划：保留 id / goal / 创建时间，
    /// 同 id 且已 Done 的步骤沿用原状态与结果
    pub fn revise(&self, steps: Vec<TaskStep>, complexity: Complexity) -> Result<Self, AgentError> {
        let done: HashMap<&str, &TaskStep> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .map(|s| (s.id.as_str(), s))
            .collect();
        let steps = steps
            .into_iter()
            .map(|mut step| {
                if let Some(prev) = done.get(step.id.as_str()) {
                    step.status = StepStatus::Done;
                    step.result = prev.result.clone();
                    step.attempts = prev.attempts;
                }
                step
            })
            .collect();
        let mut revised = Self {
            id: self.id.clone(),
            goal: self.goal.clone(),
            status: self.status,
            steps,
            complexity,
            created_at: self.created_at,
            updated_at: Utc::now(),
        };
        revised.validate()?;
        revised.refresh_ready();
        Ok(revised)
    }

    /// id 唯一、前置步骤存在、无自依赖、无环（入度拓扑排序）
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.steps.is_empty() {
            return Err(AgentError::InvalidPlan("plan has no steps".to_string()));
        }
        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(AgentError::InvalidPlan("step with empty id".to_string()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(AgentError::InvalidPlan(format!("duplicate step id '{}'", step.id)));
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            in_degree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(AgentError::InvalidPlan(format!("step '{}' depends on itself", step.id)));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(AgentError::InvalidPlan(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for next in dependents.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }
        if visited != self.steps.len() {
            return Err(AgentError::InvalidPlan("dependency cycle between steps".to_string()));
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    fn step_index(&self, id: &str) -> Result<usize, AgentError> {
        self.steps
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| AgentError::InvalidTransition(format!("unknown step '{id}'")))
    }

    fn prerequisites_done(&self, step: &TaskStep) -> bool {
        step.depends_on
            .iter()
            .all(|dep| self.step(dep).map(|d| d.status == StepStatus::Done).unwrap_or(false))
    }

    /// Pending 且前置全部 Done 的步骤置为 Ready
    pub fn refresh_ready(&mut self) {
        let ready: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Pending && self.prerequisites_done(s))
            .map(|(i, _)| i)
            .collect();
        for i in ready {
            self.steps[i].status = StepStatus::Ready;
        }
    }

    /// 计划顺序中第一个 Ready 的步骤
    pub fn next_ready(&self) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Ready)
    }

    pub fn ready_steps(&self) -> Vec<&TaskStep> {
        self.steps.iter().filter(|s| s.status == StepStatus::Ready).collect()
    }

    /// 进入 Running；前置步骤未全部 Done 时拒绝
    pub fn start_step(&mut self, id: &str) -> Result<(), AgentError> {
        let idx = self.step_index(id)?;
        let step = &self.steps[idx];
        if !matches!(step.status, StepStatus::Pending | StepStatus::Ready) {
            return Err(AgentError::InvalidTransition(format!(
                "step '{}' cannot start from {:?}",
                id, step.status
            )));
        }
        if !self.prerequisites_done(step) {
            return Err(AgentError::InvalidTransition(format!(
                "step '{id}' has unfinished prerequisites"
            )));
        }
        let step = &mut self.steps[idx];
        step.status = StepStatus::Running;
        step.attempts += 1;
        self.status = TaskStatus::Running;
        self.touch();
        Ok(())
    }

    pub fn complete_step(&mut self, id: &str, result: Value) -> Result<(), AgentError> {
        let idx = self.running_index(id)?;
        let step = &mut self.steps[idx];
        step.status = StepStatus::Done;
        step.result = Some(result);
        step.error = None;
        self.refresh_ready();
        self.touch();
        Ok(())
    }

    pub fn fail_step(&mut self, id: &str, error: impl Into<String>) -> Result<(), AgentError> {
        let idx = self.step_index(id)?;
        let step = &mut self.steps[idx];
        if step.is_terminal() {
            return Err(AgentError::InvalidTransition(format!(
                "step '{}' already {:?}",
                id, step.status
            )));
        }
        step.status = StepStatus::Failed;
        step.error = Some(error.into());
        self.touch();
        Ok(())
    }

    /// Running → Ready，保留本次结果供下一轮参考
    pub fn retry_step(&mut self, id: &str, result: Option<Value>) -> Result<(), AgentError> {
        let idx = self.running_index(id)?;
        let step = &mut self.steps[idx];
        step.status = StepStatus::Ready;
        step.result = result;
        self.touch();
        Ok(())
    }

    fn running_index(&self, id: &str) -> Result<usize, AgentError> {
        let idx = self.step_index(id)?;
        if self.steps[idx].status != StepStatus::Running {
            return Err(AgentError::InvalidTransition(format!(
                "step '{}' is {:?}, not running",
                id, self.steps[idx].status
            )));
        }
        Ok(idx)
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Done)
    }

    /// 第一个失败的步骤（终止时作为失败原因）
    pub fn first_failed(&self) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    pub fn mark_succeeded(&mut self) {
        self.status = TaskStatus::Succeeded;
        self.touch();
    }

    pub fn mark_failed(&mut self) {
        self.status = TaskStatus::Failed;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 推理日志中的动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Tool {
        server: String,
        tool: String,
        arguments: Value,
    },
    Finish,
}

/// 一次迭代的推理记录（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub iteration: usize,
    pub thought: String,
    pub action: Action,
    pub observation: String,
    pub confidence: f64,
}
