use thiserror::Error;

use crate::error::OrchestratorError;
use crate::models::TaskId;

/// Error types for host role command transitions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Task {task_id} has exhausted its attempt budget ({attempts} attempts)")]
    AttemptsExhausted { task_id: TaskId, attempts: u16 },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<StateMachineError> for OrchestratorError {
    fn from(err: StateMachineError) -> Self {
        OrchestratorError::StateTransition(err.to_string())
    }
}
