//! # Status Aggregation
//!
//! Stage and request statuses are derived from task statuses. Nothing
//! mutates them directly: [`StatusAggregator::refresh_request`] recomputes
//! them from the current task snapshot and caches the result in the
//! repository, so running it twice (or from two places at once) is harmless.
//!
//! ## Stage rules, first match wins
//!
//! 1. no tasks: `COMPLETED`
//! 2. every task `PENDING`: `PENDING`
//! 3. any task in the holding family: that status, `HOLDING_FAILED` over
//!    `HOLDING_TIMEDOUT` over `HOLDING`
//! 4. a role's success factor is breached (non-skippable stages only):
//!    `FAILED`, or `TIMEDOUT` when every breaching failure was a timeout
//! 5. some tasks aborted and none still active: `ABORTED`
//! 6. only pending and queued tasks, at least one queued: `QUEUED`
//! 7. any task still active: `IN_PROGRESS`
//! 8. otherwise `COMPLETED`
//!
//! ## Request rule
//!
//! `COMPLETED` when every stage is; otherwise the first stage that is not
//! `COMPLETED` decides. A `PENDING` stage behind completed ones reports the
//! request as `IN_PROGRESS`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::constants::events;
use crate::error::{OrchestratorError, Result};
use crate::events::EventPublisher;
use crate::logging::log_request_operation;
use crate::models::{
    HostRoleCommand, RequestId, Role, RoleCommand, Stage, StageId, StageStatusSummary, TaskId,
};
use crate::repository::{is_request_finished, TaskRepository};
use crate::state_machine::HostRoleStatus;

const SUCCESS_FACTOR_EPSILON: f64 = 1e-9;

/// Aggregate status of one stage from its task snapshot.
pub fn calculate_stage_status(stage: &Stage) -> HostRoleStatus {
    let tasks = &stage.tasks;
    if tasks.is_empty() {
        return HostRoleStatus::Completed;
    }
    if tasks.iter().all(|t| t.status == HostRoleStatus::Pending) {
        return HostRoleStatus::Pending;
    }

    for holding in [
        HostRoleStatus::HoldingFailed,
        HostRoleStatus::HoldingTimedOut,
        HostRoleStatus::Holding,
    ] {
        if tasks.iter().any(|t| t.status == holding) {
            return holding;
        }
    }

    if !stage.policy.skippable {
        if let Some(breach) = success_factor_breach(stage) {
            return breach;
        }
    }

    let any_active = tasks.iter().any(HostRoleCommand::is_active);
    if !any_active && tasks.iter().any(|t| t.status == HostRoleStatus::Aborted) {
        return HostRoleStatus::Aborted;
    }

    let waiting = |t: &HostRoleCommand| {
        matches!(t.status, HostRoleStatus::Pending | HostRoleStatus::Queued)
    };
    if tasks.iter().all(waiting) && tasks.iter().any(|t| t.status == HostRoleStatus::Queued) {
        return HostRoleStatus::Queued;
    }

    if any_active {
        HostRoleStatus::InProgress
    } else {
        HostRoleStatus::Completed
    }
}

/// `FAILED`/`TIMEDOUT` when some role has fewer successes left possible than
/// its success factor demands.
fn success_factor_breach(stage: &Stage) -> Option<HostRoleStatus> {
    #[derive(Default)]
    struct RoleTally {
        counted: usize,
        failed: usize,
        timed_out: usize,
    }

    let mut tallies: HashMap<&Role, RoleTally> = HashMap::new();
    for task in &stage.tasks {
        if task.status == HostRoleStatus::Aborted {
            continue;
        }
        let tally = tallies.entry(&task.role).or_default();
        tally.counted += 1;
        match task.status {
            HostRoleStatus::Failed => tally.failed += 1,
            HostRoleStatus::TimedOut if !task.has_attempts_remaining() => tally.timed_out += 1,
            _ => {}
        }
    }

    let mut breached = false;
    let mut any_plain_failure = false;
    for (role, tally) in &tallies {
        let failures = tally.failed + tally.timed_out;
        if failures == 0 {
            continue;
        }
        let required = stage.policy.success_factor_for(role) * tally.counted as f64;
        let possible = (tally.counted - failures) as f64;
        if possible < required - SUCCESS_FACTOR_EPSILON {
            breached = true;
            any_plain_failure |= tally.failed > 0;
        }
    }

    match (breached, any_plain_failure) {
        (false, _) => None,
        (true, true) => Some(HostRoleStatus::Failed),
        (true, false) => Some(HostRoleStatus::TimedOut),
    }
}

/// Aggregate status of a request from its stage statuses in stage order.
pub fn calculate_request_status(stage_statuses: &[HostRoleStatus]) -> HostRoleStatus {
    match stage_statuses
        .iter()
        .enumerate()
        .find(|(_, status)| **status != HostRoleStatus::Completed)
    {
        None => HostRoleStatus::Completed,
        Some((index, HostRoleStatus::Pending)) if index > 0 => HostRoleStatus::InProgress,
        Some((_, status)) => *status,
    }
}

/// Share of work done across `tasks`, 0 to 100.
///
/// Resolved tasks count fully, running and held tasks partially.
pub fn progress_percent<'a>(tasks: impl IntoIterator<Item = &'a HostRoleCommand>) -> f64 {
    let mut total = 0usize;
    let mut done = 0.0;
    for task in tasks {
        total += 1;
        done += if task.is_resolved() {
            1.0
        } else {
            match task.status {
                HostRoleStatus::InProgress
                | HostRoleStatus::Holding
                | HostRoleStatus::HoldingFailed
                | HostRoleStatus::HoldingTimedOut => 0.35,
                HostRoleStatus::Queued => 0.09,
                _ => 0.0,
            }
        };
    }
    if total == 0 {
        return 100.0;
    }
    (done / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// The failed or timed-out task that finished last, for failure diagnostics.
pub fn most_recent_failure<'a>(
    tasks: impl IntoIterator<Item = &'a HostRoleCommand>,
) -> Option<&'a HostRoleCommand> {
    tasks
        .into_iter()
        .filter(|task| task.status.is_failure())
        .max_by_key(|task| (task.end_time, task.task_id))
}

/// Per-task detail exposed to status pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub host_name: Option<String>,
    pub role: Role,
    pub command: RoleCommand,
    pub command_detail: String,
    pub status: HostRoleStatus,
    pub attempt_count: u16,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub structured_out: Option<Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl From<&HostRoleCommand> for TaskStatusView {
    fn from(task: &HostRoleCommand) -> Self {
        Self {
            task_id: task.task_id,
            host_name: task.host_name.clone(),
            role: task.role.clone(),
            command: task.command,
            command_detail: task.command_detail.clone(),
            status: task.status,
            attempt_count: task.attempt_count,
            exit_code: task.exit_code,
            stdout: task.stdout.clone(),
            stderr: task.stderr.clone(),
            structured_out: task.structured_out.clone(),
            start_time: task.start_time,
            end_time: task.end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatusView {
    pub stage_id: StageId,
    pub context: String,
    pub status: HostRoleStatus,
    pub summary: StageStatusSummary,
    pub tasks: Vec<TaskStatusView>,
}

/// Polling view of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStatusResponse {
    pub request_id: RequestId,
    pub cluster_name: String,
    pub context: String,
    pub aggregate_status: HostRoleStatus,
    pub progress_percent: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub stages: Vec<StageStatusView>,
}

/// Recomputes and caches stage and request statuses.
#[derive(Clone)]
pub struct StatusAggregator {
    repository: Arc<dyn TaskRepository>,
    events: EventPublisher,
}

impl std::fmt::Debug for StatusAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusAggregator").finish_non_exhaustive()
    }
}

impl StatusAggregator {
    pub fn new(repository: Arc<dyn TaskRepository>, events: EventPublisher) -> Self {
        Self { repository, events }
    }

    /// Recompute every stage status and the request status, store the ones
    /// that changed and announce the changes. Returns the request status.
    #[instrument(skip(self), fields(request_id = request_id))]
    pub async fn refresh_request(&self, request_id: RequestId) -> Result<HostRoleStatus> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("request", request_id))?;
        let stages = self.repository.stages_for_request(request_id).await?;

        let mut statuses = Vec::with_capacity(stages.len());
        for stage in &stages {
            let status = calculate_stage_status(stage);
            if status != stage.status {
                self.repository
                    .update_stage_status(request_id, stage.stage_id, status)
                    .await?;
                debug!(
                    stage_id = stage.stage_id,
                    from = %stage.status,
                    to = %status,
                    "Stage status changed"
                );
                if let Err(err) = self
                    .events
                    .publish_stage_status(request_id, stage.stage_id, stage.status, status)
                    .await
                {
                    warn!(error = %err, "Failed to publish stage event");
                }
            }
            statuses.push(status);
        }

        let status = calculate_request_status(&statuses);
        let tasks = stages.iter().flat_map(|stage| stage.tasks.iter());
        let start_time = tasks.clone().filter_map(|task| task.start_time).min();
        let end_time = if is_request_finished(status) {
            tasks.filter_map(|task| task.end_time).max()
        } else {
            None
        };

        if status != request.status
            || start_time != request.start_time
            || end_time != request.end_time
        {
            self.repository
                .update_request_status(request_id, status, start_time, end_time)
                .await?;
        }

        if status != request.status {
            self.announce_request_status(&request.cluster_name, request_id, request.status, status)
                .await;
        }
        Ok(status)
    }

    async fn announce_request_status(
        &self,
        cluster_name: &str,
        request_id: RequestId,
        from: HostRoleStatus,
        to: HostRoleStatus,
    ) {
        let context = json!({
            "request_id": request_id,
            "cluster_name": cluster_name,
            "from": from,
            "to": to,
        });
        if let Err(err) = self
            .events
            .publish(events::REQUEST_STATUS_CHANGED, context.clone())
            .await
        {
            warn!(error = %err, "Failed to publish event");
        }

        let terminal_event = match to {
            HostRoleStatus::Completed => Some(events::REQUEST_COMPLETED),
            HostRoleStatus::Failed | HostRoleStatus::TimedOut => Some(events::REQUEST_FAILED),
            HostRoleStatus::Aborted => Some(events::REQUEST_ABORTED),
            _ => None,
        };
        if let Some(name) = terminal_event {
            if let Err(err) = self.events.publish(name, context).await {
                warn!(error = %err, "Failed to publish event");
            }
            log_request_operation("finish", request_id, Some(cluster_name), to.as_str(), None);
        }
    }

    /// Fresh status view of a request, computed from the task snapshot.
    pub async fn request_status(&self, request_id: RequestId) -> Result<RequestStatusResponse> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("request", request_id))?;
        let stages = self.repository.stages_for_request(request_id).await?;

        let views: Vec<StageStatusView> = stages
            .iter()
            .map(|stage| StageStatusView {
                stage_id: stage.stage_id,
                context: stage.context.clone(),
                status: calculate_stage_status(stage),
                summary: StageStatusSummary::from_stage(stage),
                tasks: stage.tasks.iter().map(TaskStatusView::from).collect(),
            })
            .collect();
        let statuses: Vec<HostRoleStatus> = views.iter().map(|view| view.status).collect();

        Ok(RequestStatusResponse {
            request_id,
            cluster_name: request.cluster_name,
            context: request.context,
            aggregate_status: calculate_request_status(&statuses),
            progress_percent: progress_percent(stages.iter().flat_map(|s| s.tasks.iter())),
            start_time: request.start_time,
            end_time: request.end_time,
            stages: views,
        })
    }
}
