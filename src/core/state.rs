//! 推理循环阶段
//!
//! Idle → Planning → {Selecting → Acting → Observing}* → Done | Failed

use serde::Serialize;

use crate::core::AgentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Planning,
    Selecting,
    Acting,
    Observing,
    Done,
    Failed,
}

impl LoopPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopPhase::Done | LoopPhase::Failed)
    }

    /// 合法的阶段迁移；任何非终止阶段都可以直接进入 Done / Failed
    pub fn can_transition_to(self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Done) | (_, Failed) => self != Idle,
            (Idle, Planning) => true,
            (Planning, Selecting) => true,
            (Selecting, Acting) | (Selecting, Selecting) => true,
            (Acting, Observing) | (Acting, Selecting) => true,
            (Observing, Selecting) => true,
            _ => false,
        }
    }

    pub fn transition(self, next: LoopPhase) -> Result<LoopPhase, AgentError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AgentError::InvalidTransition(format!("loop phase {self:?} -> {next:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut phase = LoopPhase::Idle;
        for next in [
            LoopPhase::Planning,
            LoopPhase::Selecting,
            LoopPhase::Acting,
            LoopPhase::Observing,
            LoopPhase::Selecting,
            LoopPhase::Done,
        ] {
            phase = phase.transition(next).unwrap();
        }
        assert!(phase.is_terminal());
    }

    #[test]
    fn test_terminal_is_final() {
        assert!(LoopPhase::Done.transition(LoopPhase::Planning).is_err());
        assert!(LoopPhase::Failed.transition(LoopPhase::Failed).is_err());
    }

    #[test]
    fn test_cannot_act_without_selecting() {
        assert!(!LoopPhase::Planning.can_transition_to(LoopPhase::Acting));
        assert!(!LoopPhase::Idle.can_transition_to(LoopPhase::Done));
        assert!(LoopPhase::Planning.can_transition_to(LoopPhase::Failed));
    }
}
