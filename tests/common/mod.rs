//! Shared wiring for integration tests: an in-memory cluster with a
//! recording transport and every orchestration component attached.

#![allow(dead_code)]

pub mod strategies;

use std::sync::Arc;

use clusterops_core::config::OrchestratorConfig;
use clusterops_core::events::EventPublisher;
use clusterops_core::models::{CommandReport, HostRoleCommand, RequestId, Role, RoleCommand, TaskId};
use clusterops_core::orchestration::{ActionManager, ActionScheduler, HeartbeatProcessor};
use clusterops_core::ordering::{RoleOrderingRules, StackId, StaticRoleOrderProvider};
use clusterops_core::repository::{InMemoryTaskRepository, TaskRepository};
use clusterops_core::state_machine::HostRoleStatus;
use clusterops_core::topology::StaticClusterTopology;
use clusterops_core::transport::RecordingTransport;

pub const CLUSTER: &str = "c1";

pub fn hdp_stack() -> StackId {
    StackId::new("HDP", "2.6")
}

pub struct TestCluster {
    pub config: OrchestratorConfig,
    pub repository: Arc<InMemoryTaskRepository>,
    pub transport: Arc<RecordingTransport>,
    pub topology: Arc<StaticClusterTopology>,
    pub events: EventPublisher,
    pub scheduler: Arc<ActionScheduler>,
    pub reports: Arc<HeartbeatProcessor>,
    pub manager: ActionManager,
}

impl TestCluster {
    pub fn new(hosts: &[&str]) -> Self {
        Self::with_config(hosts, OrchestratorConfig::default(), RoleOrderingRules::default())
    }

    pub fn with_rules(hosts: &[&str], rules: RoleOrderingRules) -> Self {
        Self::with_config(hosts, OrchestratorConfig::default(), rules)
    }

    pub fn with_config(
        hosts: &[&str],
        config: OrchestratorConfig,
        rules: RoleOrderingRules,
    ) -> Self {
        let repository = Arc::new(InMemoryTaskRepository::new());
        let transport = Arc::new(RecordingTransport::default());
        let topology = Arc::new(StaticClusterTopology::with_hosts(hosts.iter().copied()));
        let events = EventPublisher::new(config.events.channel_capacity);

        let scheduler = Arc::new(ActionScheduler::new(
            repository.clone(),
            transport.clone(),
            topology.clone(),
            events.clone(),
            config.scheduler.clone(),
        ));
        let reports = Arc::new(HeartbeatProcessor::new(
            repository.clone(),
            events.clone(),
            config.scheduler.conflict_retries,
        ));
        let manager = ActionManager::new(
            repository.clone(),
            topology.clone(),
            Arc::new(StaticRoleOrderProvider::new(rules)),
            events.clone(),
            &config,
        )
        .with_scheduler_wakeup(scheduler.wakeup_handle());

        Self {
            config,
            repository,
            transport,
            topology,
            events,
            scheduler,
            reports,
            manager,
        }
    }

    /// Another scheduler over the same repository and transport, as a
    /// second server process would be.
    pub fn second_scheduler(&self) -> Arc<ActionScheduler> {
        Arc::new(ActionScheduler::new(
            self.repository.clone(),
            self.transport.clone(),
            self.topology.clone(),
            self.events.clone(),
            self.config.scheduler.clone(),
        ))
    }

    pub fn task_for(&self, host: &str, role: &str) -> HostRoleCommand {
        self.manager
            .new_task(Some(host.to_string()), Role::new(role), RoleCommand::Start)
    }

    /// Submit one stage per entry, each a START of `role` on every listed host.
    pub async fn submit_stages(&self, stages: &[(&str, &[&str])]) -> RequestId {
        self.submit_tasks(
            stages
                .iter()
                .map(|(role, hosts)| hosts.iter().map(|host| self.task_for(host, role)).collect())
                .collect(),
        )
        .await
    }

    pub async fn submit_tasks(&self, stages: Vec<Vec<HostRoleCommand>>) -> RequestId {
        let mut container = self
            .manager
            .create_request(CLUSTER, "Start services")
            .await
            .unwrap();
        for (index, tasks) in stages.into_iter().enumerate() {
            let mut stage = self.manager.new_stage(CLUSTER, &format!("stage {index}"));
            for task in tasks {
                stage.add_task(task);
            }
            container.add_stage(stage);
        }
        self.manager
            .submit(&mut container)
            .await
            .unwrap()
            .unwrap()
            .request_id
    }

    pub async fn task(&self, task_id: TaskId) -> HostRoleCommand {
        self.repository.get_task(task_id).await.unwrap().unwrap()
    }

    pub async fn tasks(&self, request_id: RequestId) -> Vec<HostRoleCommand> {
        self.repository.tasks_for_request(request_id).await.unwrap()
    }

    pub async fn request_status(&self, request_id: RequestId) -> HostRoleStatus {
        self.manager
            .request_status(request_id)
            .await
            .unwrap()
            .aggregate_status
    }

    /// Report success for every dispatched task still awaiting a report.
    pub async fn complete_in_flight(&self) -> usize {
        let mut completed = 0;
        for task_id in self.transport.sent_task_ids() {
            if self.task(task_id).await.status.accepts_reports()
                && self
                    .reports
                    .apply_report(CommandReport::completed(task_id, 0))
                    .await
                    .unwrap()
                    .is_applied()
            {
                completed += 1;
            }
        }
        completed
    }

    /// Tick and complete until the request finishes or `max_rounds` pass.
    pub async fn run_to_completion(&self, request_id: RequestId, max_rounds: usize) -> HostRoleStatus {
        for _ in 0..max_rounds {
            self.scheduler.tick().await.unwrap();
            let status = self.request_status(request_id).await;
            if clusterops_core::repository::is_request_finished(status) {
                return status;
            }
            self.complete_in_flight().await;
        }
        self.request_status(request_id).await
    }
}
