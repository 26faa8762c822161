use thiserror::Error;

use super::jobs::JobStage;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("illegal stage transition `{from}` -> `{to}`")]
    IllegalTransition { from: JobStage, to: JobStage },
}

impl DomainError {
    /// Check a transition against the stage graph.
    pub fn check_transition(from: JobStage, to: JobStage) -> Result<(), Self> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(Self::IllegalTransition { from, to })
        }
    }
}
