//! # Command Transport
//!
//! Outbound port that carries execution commands to agents (or to the
//! server-side action executor). The scheduler only needs to know whether a
//! command was handed over and whether the receiver already started it.

pub mod channel;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::OrchestratorError;
use crate::models::ExecutionCommand;

pub use channel::{ChannelTransport, RecordingTransport};

/// Acknowledgement returned by a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAck {
    /// Handed over; the agent confirms pickup with a later report
    Accepted,
    /// Receiver started the command synchronously
    Started,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Host {0} is unreachable")]
    Unreachable(String),

    #[error("Transport channel closed")]
    Closed,

    #[error("Transport rejected command: {0}")]
    Rejected(String),
}

impl From<TransportError> for OrchestratorError {
    fn from(err: TransportError) -> Self {
        OrchestratorError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn dispatch(&self, command: ExecutionCommand) -> Result<DispatchAck, TransportError>;
}
