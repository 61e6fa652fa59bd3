//! # Error Handling
//!
//! Crate-boundary error type. Business failures (a task exiting non-zero, a
//! stage missing its success factor, a cancelled request) are never errors:
//! they are reported through aggregate status. Errors are reserved for
//! configuration problems, programming errors and infrastructure faults.

use thiserror::Error;

use crate::models::RoleCommandPair;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Role command order contains a cycle involving {pair}")]
    OrderingCycle { pair: RoleCommandPair },

    #[error("Unknown role command: {0}")]
    UnknownRoleCommand(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("State transition error: {0}")]
    StateTransition(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Configuration errors are raised at build time and must never be retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::OrderingCycle { .. } | Self::UnknownRoleCommand(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
