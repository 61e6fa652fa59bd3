//! # Action Manager
//!
//! Entry point for callers outside the scheduling loop: building and
//! submitting requests, operator interventions (cancel, retry, skip, resume)
//! and status polling. Every operation writes through the same versioned
//! task transitions the scheduler uses, then refreshes the request's cached
//! aggregate.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use super::status_aggregator::{most_recent_failure, RequestStatusResponse, StatusAggregator};
use super::task_transitions::{require_transition, transition_with_retry, TransitionOutcome};
use crate::config::{OrchestratorConfig, StageDefaultsConfig};
use crate::constants::{events, CANCELLED_REQUEST_REASON};
use crate::error::{OrchestratorError, Result};
use crate::events::EventPublisher;
use crate::logging::log_request_operation;
use crate::models::{
    HostRoleCommand, Request, RequestId, Role, RoleCommand, Stage, TaskId,
};
use crate::ordering::{RoleOrderProvider, StackId};
use crate::repository::TaskRepository;
use crate::stages::{
    DeleteIdentityHandler, DeleteIdentityParams, OrderedRequestStageContainer,
    RequestStageContainer,
};
use crate::state_machine::{CommandOutput, HostRoleStatus, TaskEvent};
use crate::topology::ClusterTopology;

pub struct ActionManager {
    repository: Arc<dyn TaskRepository>,
    topology: Arc<dyn ClusterTopology>,
    role_orders: Arc<dyn RoleOrderProvider>,
    aggregator: StatusAggregator,
    events: EventPublisher,
    stage_defaults: StageDefaultsConfig,
    conflict_retries: u32,
    wakeup: Option<Arc<Notify>>,
}

impl std::fmt::Debug for ActionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionManager")
            .field("stage_defaults", &self.stage_defaults)
            .finish_non_exhaustive()
    }
}

impl ActionManager {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        topology: Arc<dyn ClusterTopology>,
        role_orders: Arc<dyn RoleOrderProvider>,
        events: EventPublisher,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            aggregator: StatusAggregator::new(Arc::clone(&repository), events.clone()),
            repository,
            topology,
            role_orders,
            events,
            stage_defaults: config.stage_defaults.clone(),
            conflict_retries: config.scheduler.conflict_retries,
            wakeup: None,
        }
    }

    /// Wake the scheduler after submissions and operator actions.
    pub fn with_scheduler_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    fn nudge_scheduler(&self) {
        if let Some(wakeup) = &self.wakeup {
            wakeup.notify_one();
        }
    }

    /// Empty stage carrying the configured default policy.
    pub fn new_stage(&self, cluster_name: &str, context: &str) -> Stage {
        let mut stage = Stage::new(cluster_name, context);
        stage.policy = self.stage_defaults.policy();
        stage
    }

    /// Task with the configured default timeout.
    pub fn new_task(&self, host_name: Option<String>, role: Role, command: RoleCommand) -> HostRoleCommand {
        let mut task = HostRoleCommand::new(host_name, role, command);
        task.timeout_secs = self.stage_defaults.task_timeout_secs;
        task
    }

    pub async fn create_request(
        &self,
        cluster_name: &str,
        context: &str,
    ) -> Result<RequestStageContainer> {
        RequestStageContainer::create(Arc::clone(&self.repository), cluster_name, context).await
    }

    /// Request container that orders commands by the stack's role command
    /// order.
    pub async fn create_ordered_request(
        &self,
        cluster_name: &str,
        context: &str,
        stack: &StackId,
    ) -> Result<OrderedRequestStageContainer> {
        let rules = self.role_orders.role_command_order(stack)?;
        let inner = self.create_request(cluster_name, context).await?;
        Ok(OrderedRequestStageContainer::new(
            inner,
            rules,
            Arc::clone(&self.topology),
        ))
    }

    /// Persist the container's stages and announce the request.
    #[instrument(skip(self, container), fields(request_id = container.id()))]
    pub async fn submit(&self, container: &mut RequestStageContainer) -> Result<Option<Request>> {
        let Some(request) = container.persist().await? else {
            return Ok(None);
        };
        self.aggregator.refresh_request(request.request_id).await?;

        if let Err(err) = self
            .events
            .publish(
                events::REQUEST_CREATED,
                json!({
                    "request_id": request.request_id,
                    "cluster_name": request.cluster_name,
                    "context": request.context,
                    "stages": request.stage_ids.len(),
                    "exclusive": request.exclusive,
                }),
            )
            .await
        {
            warn!(error = %err, "Failed to publish event");
        }
        log_request_operation(
            "submit",
            request.request_id,
            Some(&request.cluster_name),
            HostRoleStatus::Pending.as_str(),
            Some(&request.context),
        );
        self.nudge_scheduler();
        Ok(Some(request))
    }

    /// Build and submit an identity deletion request.
    pub async fn submit_identity_deletion(
        &self,
        cluster_name: &str,
        stack: &StackId,
        params: &DeleteIdentityParams,
        manage_identities: bool,
    ) -> Result<Option<Request>> {
        let mut container = self
            .create_ordered_request(cluster_name, "Delete identities", stack)
            .await?;
        DeleteIdentityHandler::new(
            self.stage_defaults.task_timeout_secs,
            Arc::clone(&self.topology),
        )
        .add_delete_identity_stages(cluster_name, &mut container, params, manage_identities)?;
        self.submit(container.inner_mut()).await
    }

    /// Abort every unresolved task of the request. Returns how many were
    /// aborted.
    #[instrument(skip(self))]
    pub async fn cancel_request(&self, request_id: RequestId) -> Result<usize> {
        let request = self
            .repository
            .get_request(request_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("request", request_id))?;

        let mut aborted = 0;
        for task in self.repository.tasks_for_request(request_id).await? {
            if task.is_resolved() {
                continue;
            }
            let outcome = transition_with_retry(
                self.repository.as_ref(),
                task.task_id,
                self.conflict_retries,
                |current| {
                    (!current.is_resolved())
                        .then(|| TaskEvent::Abort(CANCELLED_REQUEST_REASON.to_string()))
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

        let status = self.aggregator.refresh_request(request_id).await?;
        info!(request_id, aborted, status = %status, "Request cancelled");
        log_request_operation(
            "cancel",
            request_id,
            Some(&request.cluster_name),
            status.as_str(),
            None,
        );
        Ok(aborted)
    }

    /// Give a failed, timed-out, held or aborted task a fresh attempt budget.
    pub async fn retry_task(&self, task_id: TaskId) -> Result<HostRoleCommand> {
        let task = require_transition(
            self.repository.as_ref(),
            task_id,
            self.conflict_retries,
            TaskEvent::Retry,
        )
        .await?;
        if let Err(err) = self.events.publish_task(events::TASK_RETRY_REQUESTED, &task).await {
            warn!(error = %err, "Failed to publish task event");
        }
        self.aggregator.refresh_request(task.request_id).await?;
        self.nudge_scheduler();
        Ok(task)
    }

    /// Retry every retryable task of a request, including work aborted
    /// behind a failed stage.
    pub async fn retry_failed_tasks(&self, request_id: RequestId) -> Result<usize> {
        let mut retried = 0;
        for task in self.repository.tasks_for_request(request_id).await? {
            let retryable = matches!(
                task.status,
                HostRoleStatus::Failed
                    | HostRoleStatus::Aborted
                    | HostRoleStatus::HoldingFailed
                    | HostRoleStatus::HoldingTimedOut
            ) || (task.status == HostRoleStatus::TimedOut && !task.has_attempts_remaining());
            if !retryable {
                continue;
            }
            let outcome = transition_with_retry(
                self.repository.as_ref(),
                task.task_id,
                self.conflict_retries,
                |_| Some(TaskEvent::Retry),
            )
            .await?;
            if let TransitionOutcome::Applied(updated) = outcome {
                retried += 1;
                if let Err(err) = self
                    .events
                    .publish_task(events::TASK_RETRY_REQUESTED, &updated)
                    .await
                {
                    warn!(error = %err, "Failed to publish task event");
                }
            }
        }
        self.aggregator.refresh_request(request_id).await?;
        self.nudge_scheduler();
        Ok(retried)
    }

    /// Accept a held failure and let the request move on.
    pub async fn skip_task(&self, task_id: TaskId) -> Result<HostRoleCommand> {
        let task = require_transition(
            self.repository.as_ref(),
            task_id,
            self.conflict_retries,
            TaskEvent::Skip,
        )
        .await?;
        if let Err(err) = self.events.publish_task(events::TASK_SKIPPED, &task).await {
            warn!(error = %err, "Failed to publish task event");
        }
        self.aggregator.refresh_request(task.request_id).await?;
        self.nudge_scheduler();
        Ok(task)
    }

    /// Confirm a manual task parked in `HOLDING`.
    pub async fn resume_held_task(
        &self,
        task_id: TaskId,
        output: CommandOutput,
    ) -> Result<HostRoleCommand> {
        self.resolve_held_task(task_id, TaskEvent::Complete(output), events::TASK_COMPLETED)
            .await
    }

    /// Reject a manual task parked in `HOLDING`.
    pub async fn fail_held_task(
        &self,
        task_id: TaskId,
        output: CommandOutput,
    ) -> Result<HostRoleCommand> {
        self.resolve_held_task(task_id, TaskEvent::Fail(output), events::TASK_FAILED)
            .await
    }

    async fn resolve_held_task(
        &self,
        task_id: TaskId,
        event: TaskEvent,
        event_name: &str,
    ) -> Result<HostRoleCommand> {
        let outcome = transition_with_retry(
            self.repository.as_ref(),
            task_id,
            self.conflict_retries,
            |current| (current.status == HostRoleStatus::Holding).then(|| event.clone()),
        )
        .await?;
        let task = match outcome {
            TransitionOutcome::Applied(task) => task,
            TransitionOutcome::NotFound => {
                return Err(OrchestratorError::not_found("task", task_id))
            }
            _ => {
                return Err(OrchestratorError::StateTransition(format!(
                    "task {task_id} is not holding"
                )))
            }
        };
        if let Err(err) = self.events.publish_task(event_name, &task).await {
            warn!(error = %err, "Failed to publish task event");
        }
        self.aggregator.refresh_request(task.request_id).await?;
        self.nudge_scheduler();
        Ok(task)
    }

    pub async fn request_status(&self, request_id: RequestId) -> Result<RequestStatusResponse> {
        self.aggregator.request_status(request_id).await
    }

    /// Failed or timed-out task of the request that finished last.
    pub async fn most_recent_failure(
        &self,
        request_id: RequestId,
    ) -> Result<Option<HostRoleCommand>> {
        let tasks = self.repository.tasks_for_request(request_id).await?;
        Ok(most_recent_failure(&tasks).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordering::{RoleOrderingRules, StaticRoleOrderProvider};
    use crate::repository::InMemoryTaskRepository;
    use crate::topology::StaticClusterTopology;

    fn manager(repo: Arc<InMemoryTaskRepository>) -> ActionManager {
        ActionManager::new(
            repo,
            Arc::new(StaticClusterTopology::with_hosts(["h1", "h2"])),
            Arc::new(StaticRoleOrderProvider::new(RoleOrderingRules::default())),
            EventPublisher::default(),
            &OrchestratorConfig::default(),
        )
    }

    async fn submitted(manager: &ActionManager, hosts: &[&str]) -> Request {
        let mut container = manager.create_request("c1", "Start DataNodes").await.unwrap();
        let mut stage = manager.new_stage("c1", "Start");
        for host in hosts {
            stage.add_task(manager.new_task(
                Some(host.to_string()),
                Role::new("DATANODE"),
                RoleCommand::Start,
            ));
        }
        container.add_stage(stage);
        manager.submit(&mut container).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_cancel_aborts_unresolved_tasks() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let manager = manager(repo.clone());
        let request = submitted(&manager, &["h1", "h2"]).await;

        assert_eq!(manager.cancel_request(request.request_id).await.unwrap(), 2);
        let status = manager.request_status(request.request_id).await.unwrap();
        assert_eq!(status.aggregate_status, HostRoleStatus::Aborted);
        assert!(status.stages[0].tasks[0]
            .stderr
            .contains(CANCELLED_REQUEST_REASON));

        assert_eq!(manager.cancel_request(request.request_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_reopens_cancelled_task() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let manager = manager(repo.clone());
        let request = submitted(&manager, &["h1"]).await;
        manager.cancel_request(request.request_id).await.unwrap();

        let task = manager.retry_task(1).await.unwrap();
        assert_eq!(task.status, HostRoleStatus::Pending);
        assert_eq!(
            repo.get_request(request.request_id).await.unwrap().unwrap().status,
            HostRoleStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_operator_errors() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let manager = manager(repo.clone());
        submitted(&manager, &["h1"]).await;

        assert!(matches!(
            manager.retry_task(1).await,
            Err(OrchestratorError::StateTransition(_))
        ));
        assert!(matches!(
            manager.skip_task(77).await,
            Err(OrchestratorError::NotFound { .. })
        ));
        assert!(manager
            .resume_held_task(1, CommandOutput::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_empty_container_is_not_submitted() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let manager = manager(repo.clone());
        let mut container = manager.create_request("c1", "Nothing").await.unwrap();
        assert!(manager.submit(&mut container).await.unwrap().is_none());
        assert_eq!(repo.request_count(), 0);
    }
}
