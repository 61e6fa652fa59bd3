use serde::{Deserialize, Serialize};
use std::fmt;

/// Host role command status.
///
/// `PENDING -> QUEUED -> IN_PROGRESS -> {COMPLETED, FAILED, TIMEDOUT, ABORTED}`
/// plus the holding family used for operator intervention and
/// `SKIPPED_FAILED` for failures on non-blocking stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRoleStatus {
    /// Created with its stage, not yet dispatched
    Pending,
    /// Handed to the transport, agent pickup not yet confirmed
    Queued,
    /// Running on the agent (or on the server for server actions)
    InProgress,
    /// Manual task waiting for an operator to confirm
    Holding,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Failed and parked for an operator decision
    HoldingFailed,
    /// No terminal report arrived within the timeout window
    #[serde(rename = "TIMEDOUT")]
    TimedOut,
    /// Timed out and parked for an operator decision
    #[serde(rename = "HOLDING_TIMEDOUT")]
    HoldingTimedOut,
    /// Cancelled by the operator or by an upstream stage failure
    Aborted,
    /// Failed on a stage that tolerates failures
    SkippedFailed,
}

impl HostRoleStatus {
    pub const ALL: [HostRoleStatus; 11] = [
        Self::Pending,
        Self::Queued,
        Self::InProgress,
        Self::Holding,
        Self::Completed,
        Self::Failed,
        Self::HoldingFailed,
        Self::TimedOut,
        Self::HoldingTimedOut,
        Self::Aborted,
        Self::SkippedFailed,
    ];

    /// Statuses that never change again without an explicit operator retry.
    ///
    /// `TIMEDOUT` is not listed: a timed-out task is terminal only once its
    /// attempt budget is spent, see `HostRoleCommand::is_resolved`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Aborted | Self::SkippedFailed
        )
    }

    pub fn is_holding(&self) -> bool {
        matches!(
            self,
            Self::Holding | Self::HoldingFailed | Self::HoldingTimedOut
        )
    }

    /// Statuses that count as a failed execution for success-factor purposes.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::TimedOut | Self::HoldingFailed | Self::HoldingTimedOut
        )
    }

    /// Statuses that count as a successful execution.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::SkippedFailed)
    }

    /// Dispatched and occupying a concurrency slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }

    /// Statuses an agent report may be applied to.
    pub fn accepts_reports(&self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Holding => "HOLDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::HoldingFailed => "HOLDING_FAILED",
            Self::TimedOut => "TIMEDOUT",
            Self::HoldingTimedOut => "HOLDING_TIMEDOUT",
            Self::Aborted => "ABORTED",
            Self::SkippedFailed => "SKIPPED_FAILED",
        }
    }
}

impl fmt::Display for HostRoleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HostRoleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid host role status: {s}"))
    }
}

impl Default for HostRoleStatus {
    fn default() -> Self {
        Self::Pending
    }
}
