use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TaskId;
use crate::state_machine::{CommandOutput, TaskEvent};

/// Status carried by an agent report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
    InProgress,
    Completed,
    Failed,
    /// Manual task waiting for operator confirmation
    Holding,
}

/// Asynchronous execution report for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReport {
    pub task_id: TaskId,
    /// Attempt the report belongs to; reports for older attempts are stale
    #[serde(default)]
    pub attempt: Option<u16>,
    pub status: ReportedStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub structured_out: Option<Value>,
}

impl CommandReport {
    pub fn new(task_id: TaskId, status: ReportedStatus) -> Self {
        Self {
            task_id,
            attempt: None,
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            structured_out: None,
        }
    }

    pub fn completed(task_id: TaskId, exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::new(task_id, ReportedStatus::Completed)
        }
    }

    pub fn failed(task_id: TaskId, exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Self::new(task_id, ReportedStatus::Failed)
        }
    }

    pub fn in_progress(task_id: TaskId) -> Self {
        Self::new(task_id, ReportedStatus::InProgress)
    }

    pub fn with_attempt(mut self, attempt: u16) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ReportedStatus::Completed | ReportedStatus::Failed)
    }

    pub fn output(&self) -> CommandOutput {
        CommandOutput {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            structured_out: self.structured_out.clone(),
        }
    }

    /// Task event this report maps to. A `COMPLETED` report with a non-zero
    /// exit code is a failure.
    pub fn to_event(&self) -> TaskEvent {
        let output = self.output();
        match self.status {
            ReportedStatus::InProgress => TaskEvent::Progress(output),
            ReportedStatus::Holding => TaskEvent::Hold(output),
            ReportedStatus::Failed => TaskEvent::Fail(output),
            ReportedStatus::Completed => match self.exit_code {
                Some(code) if code != 0 => TaskEvent::Fail(output),
                _ => TaskEvent::Complete(output),
            },
        }
    }
}
