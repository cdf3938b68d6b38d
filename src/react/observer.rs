//! 结果观察：根据工具结果与步骤的成功判定推进步骤状态，并追加推理记录

use serde_json::Value;

use crate::core::AgentError;
use crate::react::task::{Action, ReasoningStep, TaskContext};
use crate::tools::ActionResult;

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 观察后的判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 成功判定未满足，步骤回到 Ready 再试
    ContinueStep,
    StepDone,
    StepFailed(String),
    /// 所有步骤均已完成
    GoalComplete,
}

pub struct ResultObserver {
    max_step_attempts: u32,
}

impl ResultObserver {
    pub fn new(max_step_attempts: u32) -> Self {
        Self {
            max_step_attempts: max_step_attempts.max(1),
        }
    }

    /// 观察一次动作结果；step 必须处于 Running
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &self,
        context: &mut TaskContext,
        step_id: &str,
        action: Action,
        result: &ActionResult,
        iteration: usize,
        thought: String,
        log: &mut Vec<ReasoningStep>,
    ) -> Result<Verdict, AgentError> {
        let (criteria, attempts) = context
            .step(step_id)
            .map(|s| (s.success.clone(), s.attempts))
            .ok_or_else(|| AgentError::InvalidTransition(format!("unknown step '{step_id}'")))?;
        let output = result.output.clone().unwrap_or(Value::Null);

        let (verdict, confidence) = if !result.success {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "tool reported failure".to_string());
            context.fail_step(step_id, error.clone())?;
            (Verdict::StepFailed(error), 0.0)
        } else if criteria.is_met(&output) {
            context.complete_step(step_id, output.clone())?;
            if context.is_complete() {
                context.mark_succeeded();
                (Verdict::GoalComplete, 1.0)
            } else {
                (Verdict::StepDone, 1.0)
            }
        } else if attempts < self.max_step_attempts {
            context.retry_step(step_id, Some(output.clone()))?;
            (Verdict::ContinueStep, 0.5)
        } else {
            let error = format!("success criteria not met after {attempts} attempts");
            context.fail_step(step_id, error.clone())?;
            (Verdict::StepFailed(error), 0.0)
        };

        let observation = match &verdict {
            Verdict::StepFailed(e) => format!("failed: {e}"),
            _ => preview(&output),
        };
        tracing::debug!(step = step_id, iteration, verdict = ?verdict, "observed");
        log.push(ReasoningStep {
            iteration,
            thought,
            action,
            observation,
            confidence,
        });
        Ok(verdict)
    }
}

/// 观察结果的文本预览，超长截断并以 ... 结尾
pub(crate) fn preview(output: &Value) -> String {
    let text = match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        let cut: String = text.chars().take(OBSERVATION_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        text
    }
}
