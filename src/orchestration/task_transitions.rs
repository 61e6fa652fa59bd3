//! Versioned task transitions.
//!
//! Every component that moves a task does it the same way: apply the event
//! to a snapshot, then compare-and-set the result. A lost race is reported
//! to the caller, which either gives up (the winner already decided) or
//! reloads and decides again.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::models::{HostRoleCommand, TaskId};
use crate::repository::{CasResult, TaskRepository};
use crate::state_machine::{StateMachineError, TaskEvent, TaskStateMachine};

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Stored; carries the task as written, with its new version
    Applied(HostRoleCommand),
    /// Another writer got there first
    Conflict,
    NotFound,
    /// The state machine refused the event for the snapshot's status
    Rejected(StateMachineError),
}

impl TransitionOutcome {
    pub fn applied(self) -> Option<HostRoleCommand> {
        match self {
            Self::Applied(task) => Some(task),
            _ => None,
        }
    }
}

/// Apply `event` to a copy of `snapshot` and write it if nobody else has.
pub async fn try_transition(
    repository: &dyn TaskRepository,
    snapshot: &HostRoleCommand,
    event: &TaskEvent,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let mut updated = snapshot.clone();
    if let Err(err) = TaskStateMachine::apply(&mut updated, event, now) {
        return Ok(TransitionOutcome::Rejected(err));
    }

    match repository.compare_and_set(&updated).await? {
        CasResult::Success { version } => {
            updated.version = version;
            Ok(TransitionOutcome::Applied(updated))
        }
        CasResult::VersionConflict { actual } => {
            debug!(
                task_id = snapshot.task_id,
                expected = snapshot.version,
                actual,
                event = event.event_type(),
                "Lost task version race"
            );
            Ok(TransitionOutcome::Conflict)
        }
        CasResult::NotFound => Ok(TransitionOutcome::NotFound),
    }
}

/// Reload-and-retry loop around [`try_transition`].
///
/// `decide` sees the freshest snapshot and returns the event to apply, or
/// `None` when the task no longer needs it. Gives up after `retries` lost
/// races.
pub async fn transition_with_retry<F>(
    repository: &dyn TaskRepository,
    task_id: TaskId,
    retries: u32,
    mut decide: F,
) -> Result<TransitionOutcome>
where
    F: FnMut(&HostRoleCommand) -> Option<TaskEvent>,
{
    for _ in 0..=retries {
        let Some(snapshot) = repository.get_task(task_id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        let Some(event) = decide(&snapshot) else {
            return Ok(TransitionOutcome::Rejected(
                StateMachineError::InvalidTransition {
                    from: snapshot.status.to_string(),
                    event: "none".to_string(),
                },
            ));
        };
        match try_transition(repository, &snapshot, &event, Utc::now()).await? {
            TransitionOutcome::Conflict => continue,
            outcome => return Ok(outcome),
        }
    }

    warn!(task_id, retries, "Gave up on task transition after repeated conflicts");
    Ok(TransitionOutcome::Conflict)
}

/// Operator-facing wrapper: anything but an applied transition is an error.
pub async fn require_transition(
    repository: &dyn TaskRepository,
    task_id: TaskId,
    retries: u32,
    event: TaskEvent,
) -> Result<HostRoleCommand> {
    match transition_with_retry(repository, task_id, retries, |_| Some(event.clone())).await? {
        TransitionOutcome::Applied(task) => Ok(task),
        TransitionOutcome::NotFound => Err(OrchestratorError::not_found("task", task_id)),
        TransitionOutcome::Rejected(err) => Err(err.into()),
        TransitionOutcome::Conflict => Err(OrchestratorError::StateTransition(format!(
            "task {task_id} kept changing; {} not applied",
            event.event_type()
        ))),
    }
}
