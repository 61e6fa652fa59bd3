use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Captured output of one command attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub structured_out: Option<Value>,
}

impl CommandOutput {
    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Default::default()
        }
    }

    /// Output carrying only a diagnostic line on stderr.
    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self {
            stderr: message.into(),
            ..Default::default()
        }
    }
}

/// Events that drive host role command transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// Scheduler claims the task for dispatch (also re-queues a retryable timeout
    /// or redelivers a queued command whose dispatch failed)
    Queue,
    /// Agent confirmed pickup, or the transport has no separate acknowledgement
    Start,
    /// Advisory progress report
    Progress(CommandOutput),
    /// Terminal success report
    Complete(CommandOutput),
    /// Terminal failure report
    Fail(CommandOutput),
    /// Timeout sweep found the attempt past its deadline
    Timeout { retryable: bool },
    /// Manual task parked until an operator confirms it
    Hold(CommandOutput),
    /// Transport rejected the command; it stays queued for redelivery
    DispatchFailed(String),
    /// Request cancelled or a blocking predecessor failed
    Abort(String),
    /// Operator retry of a failed, timed-out, held or aborted task
    Retry,
    /// Operator accepts a held failure and moves on
    Skip,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Start => "start",
            Self::Progress(_) => "progress",
            Self::Complete(_) => "complete",
            Self::Fail(_) => "fail",
            Self::Timeout { .. } => "timeout",
            Self::Hold(_) => "hold",
            Self::DispatchFailed(_) => "dispatch_failed",
            Self::Abort(_) => "abort",
            Self::Retry => "retry",
            Self::Skip => "skip",
        }
    }

    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            Self::Progress(output)
            | Self::Complete(output)
            | Self::Fail(output)
            | Self::Hold(output) => Some(output),
            _ => None,
        }
    }

    /// Events only an operator may raise
    pub fn is_operator_action(&self) -> bool {
        matches!(self, Self::Retry | Self::Skip)
    }
}
