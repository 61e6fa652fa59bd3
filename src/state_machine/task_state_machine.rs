use chrono::{DateTime, Utc};
use tracing::debug;

use super::errors::{StateMachineError, StateMachineResult};
use super::events::{CommandOutput, TaskEvent};
use super::states::HostRoleStatus;
use crate::models::HostRoleCommand;

/// Where a failure or an exhausted timeout lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Plain `FAILED` / `TIMEDOUT`
    Fail,
    /// Park in the holding family for an operator decision
    Hold,
    /// Non-blocking stage: record `SKIPPED_FAILED` and move on
    Skip,
}

impl FailureDisposition {
    pub fn for_task(task: &HostRoleCommand) -> Self {
        if task.auto_skip_on_failure {
            Self::Skip
        } else if task.hold_on_failure {
            Self::Hold
        } else {
            Self::Fail
        }
    }
}

/// Transition table for host role commands.
///
/// Stateless: the repository owns the task and the version check, this type
/// only decides targets and applies attempt bookkeeping to an in-memory copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn determine_target_state(
        current_state: HostRoleStatus,
        event: &TaskEvent,
        disposition: FailureDisposition,
    ) -> StateMachineResult<HostRoleStatus> {
        use HostRoleStatus as S;

        let target = match (current_state, event) {
            // Dispatch claims, timeout retries and redelivery after a transport error
            (S::Pending | S::TimedOut | S::Queued, TaskEvent::Queue) => S::Queued,
            (S::Queued, TaskEvent::DispatchFailed(_)) => S::Queued,

            // Pickup
            (S::Queued, TaskEvent::Start) => S::InProgress,
            (S::Queued | S::InProgress, TaskEvent::Progress(_)) => S::InProgress,

            // Terminal reports
            (S::Queued | S::InProgress | S::Holding, TaskEvent::Complete(_)) => S::Completed,
            (S::Queued | S::InProgress, TaskEvent::Fail(_)) => match disposition {
                FailureDisposition::Fail => S::Failed,
                FailureDisposition::Hold => S::HoldingFailed,
                FailureDisposition::Skip => S::SkippedFailed,
            },
            // Operator rejected a manual task
            (S::Holding, TaskEvent::Fail(_)) => S::Failed,

            (S::Queued | S::InProgress, TaskEvent::Timeout { retryable: true }) => S::TimedOut,
            (S::Queued | S::InProgress, TaskEvent::Timeout { retryable: false }) => {
                match disposition {
                    FailureDisposition::Fail => S::TimedOut,
                    FailureDisposition::Hold => S::HoldingTimedOut,
                    FailureDisposition::Skip => S::SkippedFailed,
                }
            }

            (S::Queued | S::InProgress, TaskEvent::Hold(_)) => S::Holding,

            (from, TaskEvent::Abort(_)) if !from.is_terminal() => S::Aborted,

            // Operator actions
            (
                S::Failed | S::TimedOut | S::HoldingFailed | S::HoldingTimedOut | S::Aborted,
                TaskEvent::Retry,
            ) => S::Pending,
            (S::HoldingFailed | S::HoldingTimedOut, TaskEvent::Skip) => S::SkippedFailed,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Apply `event` to `task`, updating status and attempt bookkeeping.
    ///
    /// The caller persists the result with a version check.
    pub fn apply(
        task: &mut HostRoleCommand,
        event: &TaskEvent,
        now: DateTime<Utc>,
    ) -> StateMachineResult<HostRoleStatus> {
        let current = task.status;
        if matches!(event, TaskEvent::Queue) && !task.has_attempts_remaining() {
            return Err(StateMachineError::AttemptsExhausted {
                task_id: task.task_id,
                attempts: task.attempt_count,
            });
        }

        let target =
            Self::determine_target_state(current, event, FailureDisposition::for_task(task))?;

        match event {
            TaskEvent::Queue => {
                task.attempt_count += 1;
                task.last_attempt_time = Some(now);
                task.start_time.get_or_insert(now);
                task.dispatch_error = None;
            }
            TaskEvent::Start => {
                task.start_time.get_or_insert(now);
            }
            TaskEvent::Progress(output) => {
                task.start_time.get_or_insert(now);
                capture_output(task, output);
            }
            TaskEvent::Complete(output) | TaskEvent::Fail(output) | TaskEvent::Hold(output) => {
                capture_output(task, output);
            }
            TaskEvent::Timeout { .. } => {
                append_stderr(
                    task,
                    &format!(
                        "Command timed out after {} seconds (attempt {} of {})",
                        task.timeout_secs, task.attempt_count, task.attempt_limit
                    ),
                );
            }
            TaskEvent::DispatchFailed(error) => {
                task.dispatch_error = Some(error.clone());
            }
            TaskEvent::Abort(reason) => {
                append_stderr(task, reason);
            }
            TaskEvent::Retry => {
                task.attempt_limit = task.attempt_count.saturating_add(task.max_attempts);
                task.exit_code = None;
                task.end_time = None;
                task.dispatch_error = None;
            }
            TaskEvent::Skip => {}
        }

        task.status = target;
        if task.is_resolved() || target.is_holding() {
            task.end_time.get_or_insert(now);
        }

        debug!(
            task_id = task.task_id,
            from = %current,
            to = %target,
            event = event.event_type(),
            attempt = task.attempt_count,
            "Applied task transition"
        );

        Ok(target)
    }
}

fn capture_output(task: &mut HostRoleCommand, output: &CommandOutput) {
    if output.exit_code.is_some() {
        task.exit_code = output.exit_code;
    }
    if !output.stdout.is_empty() {
        task.stdout = output.stdout.clone();
    }
    if !output.stderr.is_empty() {
        task.stderr = output.stderr.clone();
    }
    if output.structured_out.is_some() {
        task.structured_out = output.structured_out.clone();
    }
}

fn append_stderr(task: &mut HostRoleCommand, line: &str) {
    if !task.stderr.is_empty() && !task.stderr.ends_with('\n') {
        task.stderr.push('\n');
    }
    task.stderr.push_str(line);
}
