//! # Action Scheduler
//!
//! The dispatch loop. Each tick:
//!
//! 1. sweeps in-flight tasks past their deadline into `TIMEDOUT`
//! 2. walks active requests in id order, holding back requests queued
//!    behind an exclusive request on the same cluster
//! 3. finds each request's first unresolved stage; a failed, timed-out or
//!    aborted stage aborts everything after it, a holding stage waits for
//!    an operator, otherwise its dispatchable tasks are queued, built and
//!    handed to the transport within the per-host and global caps
//! 4. refreshes the cached stage and request statuses
//!
//! Every task write is a versioned compare-and-set, so any number of
//! schedulers (and the report ingestor) can run against the same repository
//! without dispatching a task twice.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, instrument, warn};

use super::command_builder::CommandBuilder;
use super::dispatch_limits::{DispatchLimits, SlotDenied};
use super::status_aggregator::{calculate_stage_status, StatusAggregator};
use super::task_transitions::{transition_with_retry, try_transition, TransitionOutcome};
use crate::config::SchedulerConfig;
use crate::constants::{events, UPSTREAM_FAILURE_REASON};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::logging::{log_error, log_task_operation};
use crate::models::{HostRoleCommand, RequestId, Stage};
use crate::repository::TaskRepository;
use crate::state_machine::{CommandOutput, HostRoleStatus, TaskEvent};
use crate::topology::ClusterTopology;
use crate::transport::{CommandTransport, DispatchAck};

/// Counts from one scheduling tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub requests_examined: usize,
    /// Requests held back behind an exclusive request
    pub requests_deferred: usize,
    pub tasks_dispatched: usize,
    pub dispatch_failures: usize,
    pub tasks_timed_out: usize,
    pub tasks_aborted: usize,
    /// Candidates left pending because a cap was reached
    pub tasks_throttled: usize,
    pub processing_duration_ms: u64,
}

pub struct ActionScheduler {
    repository: Arc<dyn TaskRepository>,
    transport: Arc<dyn CommandTransport>,
    builder: CommandBuilder,
    aggregator: StatusAggregator,
    events: EventPublisher,
    config: SchedulerConfig,
    wakeup: Arc<Notify>,
}

impl std::fmt::Debug for ActionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ActionScheduler {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        transport: Arc<dyn CommandTransport>,
        topology: Arc<dyn ClusterTopology>,
        events: EventPublisher,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            aggregator: StatusAggregator::new(Arc::clone(&repository), events.clone()),
            builder: CommandBuilder::new(topology),
            repository,
            transport,
            events,
            config,
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Share an existing wakeup handle (for example the one the report
    /// ingestor nudges) instead of the scheduler's own.
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = wakeup;
        self
    }

    /// Handle that wakes the loop before its next tick is due.
    pub fn wakeup_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run ticks until `shutdown` flips to `true`.
    ///
    /// A failed tick is logged and the loop carries on; the next tick starts
    /// from whatever the repository holds.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            "Action scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(summary) if summary.tasks_dispatched > 0 || summary.tasks_timed_out > 0 => {
                    debug!(?summary, "Scheduler tick finished");
                }
                Ok(_) => {}
                Err(err) => {
                    log_error("action_scheduler", "tick", &err.to_string(), None);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
                _ = self.wakeup.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Action scheduler stopped");
        Ok(())
    }

    /// Make statuses consistent after a restart.
    ///
    /// Queued and in-progress tasks keep their deadlines, so the regular
    /// timeout sweep reclaims anything lost while the server was down. This
    /// only refreshes the cached aggregates of every active request.
    pub async fn recover(&self) -> Result<usize> {
        let request_ids = self.repository.active_request_ids().await?;
        try_join_all(
            request_ids
                .iter()
                .map(|request_id| self.aggregator.refresh_request(*request_id)),
        )
        .await?;
        info!(requests = request_ids.len(), "Recovered active requests");
        Ok(request_ids.len())
    }

    /// One scheduling pass.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickSummary> {
        let started = Instant::now();
        let now = Utc::now();
        let mut summary = TickSummary::default();

        let in_flight = self.repository.non_terminal_tasks().await?;
        self.sweep_timeouts(&in_flight, now, &mut summary).await?;

        let in_flight = self.repository.non_terminal_tasks().await?;
        let mut limits = DispatchLimits::seeded(
            self.config.max_concurrent_tasks_per_host,
            self.config.max_concurrent_tasks,
            &in_flight,
        );

        // Cached request status lags behind operator actions and late
        // reports, so any request with unresolved work is walked as well.
        let mut request_ids: BTreeSet<RequestId> =
            self.repository.active_request_ids().await?.into_iter().collect();
        request_ids.extend(
            in_flight
                .iter()
                .filter(|task| !task.is_resolved())
                .map(|task| task.request_id),
        );

        let mut seen_clusters: HashSet<String> = HashSet::new();
        let mut exclusive_clusters: HashSet<String> = HashSet::new();
        for request_id in request_ids {
            let Some(request) = self.repository.get_request(request_id).await? else {
                continue;
            };
            let cluster = request.cluster_name.clone();
            if exclusive_clusters.contains(&cluster)
                || (request.exclusive && seen_clusters.contains(&cluster))
            {
                debug!(request_id, cluster = %cluster, "Request waits behind an exclusive request");
                summary.requests_deferred += 1;
                seen_clusters.insert(cluster);
                continue;
            }
            seen_clusters.insert(cluster.clone());
            if request.exclusive {
                exclusive_clusters.insert(cluster);
            }

            summary.requests_examined += 1;
            self.process_request(request_id, &mut limits, &mut summary)
                .await?;
            self.aggregator.refresh_request(request_id).await?;
        }

        summary.processing_duration_ms = started.elapsed().as_millis() as u64;
        Ok(summary)
    }

    async fn sweep_timeouts(
        &self,
        tasks: &[HostRoleCommand],
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        for task in tasks {
            // Waiting for redelivery; the dispatch path owns these
            if task.dispatch_error.is_some() || !task.is_timed_out_at(now) {
                continue;
            }
            let retryable = task.attempt_count < task.attempt_limit;
            let event = TaskEvent::Timeout { retryable };
            match try_transition(self.repository.as_ref(), task, &event, now).await? {
                TransitionOutcome::Applied(updated) => {
                    summary.tasks_timed_out += 1;
                    warn!(
                        task_id = updated.task_id,
                        host = ?updated.host_name,
                        attempt = updated.attempt_count,
                        status = %updated.status,
                        "Task timed out"
                    );
                    if let Err(err) = self
                        .events
                        .publish_task(events::TASK_TIMED_OUT, &updated)
                        .await
                    {
                        warn!(error = %err, "Failed to publish task event");
                    }
                }
                // A report or another scheduler changed the task first
                TransitionOutcome::Conflict | TransitionOutcome::NotFound => {}
                TransitionOutcome::Rejected(err) => {
                    debug!(task_id = task.task_id, error = %err, "Timeout not applicable");
                }
            }
        }
        Ok(())
    }

    async fn process_request(
        &self,
        request_id: RequestId,
        limits: &mut DispatchLimits,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let stages = self.repository.stages_for_request(request_id).await?;

        for (index, stage) in stages.iter().enumerate() {
            match calculate_stage_status(stage) {
                HostRoleStatus::Completed => continue,
                HostRoleStatus::Failed | HostRoleStatus::TimedOut | HostRoleStatus::Aborted => {
                    let aborted = self.abort_unresolved(&stages[index..]).await?;
                    if aborted > 0 {
                        info!(
                            request_id,
                            stage_id = stage.stage_id,
                            aborted,
                            "Aborted work behind a failed stage"
                        );
                    }
                    summary.tasks_aborted += aborted;
                    return Ok(());
                }
                HostRoleStatus::Holding
                | HostRoleStatus::HoldingFailed
                | HostRoleStatus::HoldingTimedOut => {
                    debug!(request_id, stage_id = stage.stage_id, "Stage waits for an operator");
                    return Ok(());
                }
                _ if limits.is_saturated() => {
                    debug!(request_id, stage_id = stage.stage_id, "Global dispatch cap reached");
                    return Ok(());
                }
                _ => {
                    self.dispatch_stage(stage, limits, summary).await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn abort_unresolved(&self, stages: &[Stage]) -> Result<usize> {
        let mut aborted = 0;
        for task in stages.iter().flat_map(|stage| stage.tasks.iter()) {
            if task.is_resolved() {
                continue;
            }
            let outcome = transition_with_retry(
                self.repository.as_ref(),
                task.task_id,
                self.config.conflict_retries,
                |current| {
                    (!current.is_resolved())
                        .then(|| TaskEvent::Abort(UPSTREAM_FAILURE_REASON.to_string()))
                },
            )
            .await?;
            if let TransitionOutcome::Applied(updated) = outcome {
                aborted += 1;
                if let Err(err) = self.events.publish_task(events::TASK_ABORTED, &updated).await {
                    warn!(error = %err, "Failed to publish task event");
                }
            }
        }
        Ok(aborted)
    }

    fn is_dispatchable(task: &HostRoleCommand) -> bool {
        match task.status {
            HostRoleStatus::Pending => true,
            HostRoleStatus::TimedOut => task.has_attempts_remaining(),
            HostRoleStatus::Queued => task.dispatch_error.is_some(),
            _ => false,
        }
    }

    async fn dispatch_stage(
        &self,
        stage: &Stage,
        limits: &mut DispatchLimits,
        summary: &mut TickSummary,
    ) -> Result<()> {
        for task in stage.tasks.iter().filter(|task| Self::is_dispatchable(task)) {
            let host_key = DispatchLimits::host_key(task);
            match limits.try_acquire(&host_key) {
                Ok(()) => {}
                Err(SlotDenied::Host) => {
                    summary.tasks_throttled += 1;
                    continue;
                }
                Err(SlotDenied::Global) => {
                    summary.tasks_throttled += 1;
                    return Ok(());
                }
            }

            if !self.dispatch_task(stage, task, summary).await? {
                limits.release(&host_key);
            }
        }
        Ok(())
    }

    /// Queue, build and send one task. Returns whether it now holds a slot.
    async fn dispatch_task(
        &self,
        stage: &Stage,
        task: &HostRoleCommand,
        summary: &mut TickSummary,
    ) -> Result<bool> {
        let queued = match try_transition(
            self.repository.as_ref(),
            task,
            &TaskEvent::Queue,
            Utc::now(),
        )
        .await?
        {
            TransitionOutcome::Applied(queued) => queued,
            TransitionOutcome::Conflict | TransitionOutcome::NotFound => return Ok(false),
            TransitionOutcome::Rejected(err) => {
                warn!(task_id = task.task_id, error = %err, "Task could not be queued");
                return Ok(false);
            }
        };

        let command = self.builder.build(stage, &queued);
        match self.transport.dispatch(command).await {
            Ok(ack) => {
                summary.tasks_dispatched += 1;
                log_task_operation(
                    "dispatch",
                    queued.task_id,
                    Some(queued.request_id),
                    queued.host_name.as_deref(),
                    queued.status.as_str(),
                    Some(&format!("attempt {}", queued.attempt_count)),
                );
                if let Err(err) = self.events.publish_task(events::TASK_DISPATCHED, &queued).await {
                    warn!(error = %err, "Failed to publish task event");
                }
                if ack == DispatchAck::Started {
                    // A report may already have moved the task on; that is fine
                    let _ = try_transition(
                        self.repository.as_ref(),
                        &queued,
                        &TaskEvent::Start,
                        Utc::now(),
                    )
                    .await?;
                }
                Ok(true)
            }
            Err(err) => {
                summary.dispatch_failures += 1;
                let event = if queued.has_attempts_remaining() {
                    TaskEvent::DispatchFailed(err.to_string())
                } else {
                    TaskEvent::Fail(CommandOutput::diagnostic(format!(
                        "Dispatch failed after {} attempts: {err}",
                        queued.attempt_count
                    )))
                };
                match try_transition(self.repository.as_ref(), &queued, &event, Utc::now()).await? {
                    TransitionOutcome::Applied(updated) => {
                        warn!(
                            task_id = updated.task_id,
                            host = ?updated.host_name,
                            attempt = updated.attempt_count,
                            status = %updated.status,
                            error = %err,
                            "Dispatch failed"
                        );
                        let name = if updated.status == HostRoleStatus::Queued {
                            events::TASK_DISPATCH_FAILED
                        } else {
                            events::TASK_FAILED
                        };
                        if let Err(err) = self.events.publish_task(name, &updated).await {
                            warn!(error = %err, "Failed to publish task event");
                        }
                    }
                    other => {
                        error!(
                            task_id = queued.task_id,
                            ?other,
                            "Could not record dispatch failure"
                        );
                    }
                }
                Ok(false)
            }
        }
    }
}
