//! 推理循环过程事件：供 CLI / 前端流式展示阶段、工具调用、观察与结局

use serde::Serialize;

use crate::core::LoopPhase;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    Phase { phase: LoopPhase },
    /// 计划生成或修订后的步骤数
    Planned { steps: usize, budget: usize },
    /// 第几轮迭代，处理哪个步骤
    Iteration { iteration: usize, budget: usize, step: String },
    ToolCall {
        step: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览）
    Observation { step: String, tool: String, preview: String },
    StepFailed { step: String, reason: String },
    /// 恢复动作（replan / fail_step / abort）
    Recovery { action: String, detail: String },
    Done { iterations: usize },
    Failed { iterations: usize, error: String },
}
