//! 推理层：任务上下文、规划、结果观察与推理主循环

pub mod events;
pub mod loop_;
pub mod observer;
pub mod planner;
pub mod task;

pub use events::LoopEvent;
pub use loop_::{reasoning_loop, GoalOutcome, GoalReport, LoopLimits, ReasoningSession};
pub use observer::{ResultObserver, Verdict};
pub use planner::{LlmPlanner, Observation, PlanStrategy, ReplanOutcome, RulePlanner, TaskPlanner};
pub use task::{
    Action, Complexity, ReasoningStep, StepStatus, SuccessCriteria, TaskContext, TaskStatus, TaskStep,
};
