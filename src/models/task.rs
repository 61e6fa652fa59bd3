use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::role::{Role, RoleCommand};
use super::{RequestId, StageId, TaskId};
use crate::constants::{DEFAULT_MAX_TASK_ATTEMPTS, DEFAULT_TASK_TIMEOUT_SECS};
use crate::state_machine::HostRoleStatus;

/// One command for one role on one host (or on the server when `host_name`
/// is `None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRoleCommand {
    /// Zero until the repository persists the task
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub stage_id: StageId,
    pub host_name: Option<String>,
    pub role: Role,
    pub command: RoleCommand,
    pub status: HostRoleStatus,
    /// Attempts started so far, across operator retries
    pub attempt_count: u16,
    /// Attempts allowed per retry cycle
    pub max_attempts: u16,
    /// Attempt count at which the current cycle is exhausted
    pub attempt_limit: u16,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    pub command_detail: String,
    pub command_params: Value,
    pub custom_command_name: Option<String>,
    pub server_action_class: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub structured_out: Option<Value>,
    pub auto_skip_on_failure: bool,
    pub hold_on_failure: bool,
    pub dispatch_error: Option<String>,
    pub version: i64,
}

impl HostRoleCommand {
    pub fn new(host_name: Option<String>, role: Role, command: RoleCommand) -> Self {
        let command_detail = format!("{role} {command}");
        Self {
            task_id: 0,
            request_id: 0,
            stage_id: 0,
            host_name,
            role,
            command,
            status: HostRoleStatus::Pending,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_TASK_ATTEMPTS,
            attempt_limit: DEFAULT_MAX_TASK_ATTEMPTS,
            last_attempt_time: None,
            start_time: None,
            end_time: None,
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            command_detail,
            command_params: Value::Object(Default::default()),
            custom_command_name: None,
            server_action_class: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            structured_out: None,
            auto_skip_on_failure: false,
            hold_on_failure: false,
            dispatch_error: None,
            version: 0,
        }
    }

    /// Task executed by the server itself rather than by an agent.
    pub fn server_action(action_class: impl Into<String>, timeout_secs: u64) -> Self {
        let action_class = action_class.into();
        let mut task = Self::new(None, Role::server_action(), RoleCommand::Execute);
        task.command_detail = format!("Execute {action_class}");
        task.server_action_class = Some(action_class);
        task.timeout_secs = timeout_secs;
        task
    }

    pub fn is_server_action(&self) -> bool {
        self.host_name.is_none()
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt_count < self.attempt_limit
    }

    /// Terminal, or timed out with no attempts left.
    pub fn is_resolved(&self) -> bool {
        self.status.is_terminal()
            || (self.status == HostRoleStatus::TimedOut && !self.has_attempts_remaining())
    }

    /// Still needs scheduler or agent work: pending, in flight or a
    /// retryable timeout.
    pub fn is_active(&self) -> bool {
        match self.status {
            HostRoleStatus::Pending | HostRoleStatus::Queued | HostRoleStatus::InProgress => true,
            HostRoleStatus::TimedOut => self.has_attempts_remaining(),
            _ => false,
        }
    }

    /// Instant after which the current attempt counts as timed out.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.last_attempt_time?;
        let secs = i64::try_from(self.timeout_secs).unwrap_or(i64::MAX / 1_000);
        Some(started + Duration::seconds(secs))
    }

    pub fn is_timed_out_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight() && self.deadline().is_some_and(|deadline| now >= deadline)
    }
}
