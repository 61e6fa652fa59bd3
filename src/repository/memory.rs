//! In-memory task repository.
//!
//! Task writes go through `DashMap::get_mut`, which holds the shard lock for
//! the duration of the version check and the replacement, so the
//! compare-and-set is atomic per task. Nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{
    is_request_finished, CasResult, RepositoryError, RepositoryResult, TaskRepository,
};
use crate::models::{HostRoleCommand, Request, RequestId, Stage, StageId, TaskId};
use crate::state_machine::HostRoleStatus;

#[derive(Debug, Clone)]
struct StageRecord {
    /// Stage metadata; `tasks` is always empty here
    stage: Stage,
    task_ids: Vec<TaskId>,
}

#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    last_request_id: AtomicI64,
    last_task_id: AtomicI64,
    requests: DashMap<RequestId, Request>,
    stages: RwLock<BTreeMap<(RequestId, StageId), StageRecord>>,
    tasks: DashMap<TaskId, HostRoleCommand>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    fn assemble(&self, record: &StageRecord) -> Stage {
        let mut stage = record.stage.clone();
        stage.tasks = record
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|task| task.value().clone()))
            .collect();
        stage
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn next_request_id(&self) -> RepositoryResult<RequestId> {
        Ok(self.last_request_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn persist(
        &self,
        request: &Request,
        stages: Vec<Stage>,
    ) -> RepositoryResult<Vec<Stage>> {
        let request_id = request.request_id;
        let mut stored_stages = self.stages.write();

        for stage in &stages {
            if stored_stages.contains_key(&(request_id, stage.stage_id)) {
                return Err(RepositoryError::DuplicateStage {
                    request_id,
                    stage_id: stage.stage_id,
                });
            }
        }

        let mut persisted = Vec::with_capacity(stages.len());
        for mut stage in stages {
            stage.request_id = request_id;
            let mut task_ids = Vec::with_capacity(stage.tasks.len());
            for task in &mut stage.tasks {
                task.task_id = self.last_task_id.fetch_add(1, Ordering::SeqCst) + 1;
                task.request_id = request_id;
                task.stage_id = stage.stage_id;
                task_ids.push(task.task_id);
                self.tasks.insert(task.task_id, task.clone());
            }
            stored_stages.insert(
                (request_id, stage.stage_id),
                StageRecord {
                    stage: stage.template(),
                    task_ids,
                },
            );
            persisted.push(stage);
        }

        let mut request = request.clone();
        request.stage_ids = stored_stages
            .range((request_id, StageId::MIN)..=(request_id, StageId::MAX))
            .map(|((_, stage_id), _)| *stage_id)
            .collect();
        self.requests.insert(request_id, request);

        Ok(persisted)
    }

    async fn get_request(&self, request_id: RequestId) -> RepositoryResult<Option<Request>> {
        Ok(self.requests.get(&request_id).map(|r| r.value().clone()))
    }

    async fn get_stage(
        &self,
        request_id: RequestId,
        stage_id: StageId,
    ) -> RepositoryResult<Option<Stage>> {
        let stages = self.stages.read();
        Ok(stages
            .get(&(request_id, stage_id))
            .map(|record| self.assemble(record)))
    }

    async fn get_task(&self, task_id: TaskId) -> RepositoryResult<Option<HostRoleCommand>> {
        Ok(self.tasks.get(&task_id).map(|t| t.value().clone()))
    }

    async fn stages_for_request(&self, request_id: RequestId) -> RepositoryResult<Vec<Stage>> {
        let stages = self.stages.read();
        Ok(stages
            .range((request_id, StageId::MIN)..=(request_id, StageId::MAX))
            .map(|(_, record)| self.assemble(record))
            .collect())
    }

    async fn tasks_for_request(
        &self,
        request_id: RequestId,
    ) -> RepositoryResult<Vec<HostRoleCommand>> {
        let mut tasks: Vec<HostRoleCommand> = self
            .tasks
            .iter()
            .filter(|task| task.request_id == request_id)
            .map(|task| task.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.task_id);
        Ok(tasks)
    }

    async fn non_terminal_tasks(&self) -> RepositoryResult<Vec<HostRoleCommand>> {
        let mut tasks: Vec<HostRoleCommand> = self
            .tasks
            .iter()
            .filter(|task| !task.status.is_terminal())
            .map(|task| task.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.task_id);
        Ok(tasks)
    }

    async fn active_request_ids(&self) -> RepositoryResult<Vec<RequestId>> {
        let mut ids: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|request| !is_request_finished(request.status))
            .map(|request| request.request_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn compare_and_set(&self, task: &HostRoleCommand) -> RepositoryResult<CasResult> {
        let Some(mut stored) = self.tasks.get_mut(&task.task_id) else {
            return Ok(CasResult::NotFound);
        };
        if stored.version != task.version {
            return Ok(CasResult::VersionConflict {
                actual: stored.version,
            });
        }
        let mut next = task.clone();
        next.version += 1;
        let version = next.version;
        *stored = next;
        Ok(CasResult::Success { version })
    }

    async fn update_stage_status(
        &self,
        request_id: RequestId,
        stage_id: StageId,
        status: HostRoleStatus,
    ) -> RepositoryResult<()> {
        let mut stages = self.stages.write();
        let record = stages
            .get_mut(&(request_id, stage_id))
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "stage",
                id: format!("{request_id}-{stage_id}"),
            })?;
        record.stage.status = status;
        Ok(())
    }

    async fn update_request_status(
        &self,
        request_id: RequestId,
        status: HostRoleStatus,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        let mut request =
            self.requests
                .get_mut(&request_id)
                .ok_or_else(|| RepositoryError::NotFound {
                    entity: "request",
                    id: request_id.to_string(),
                })?;
        request.status = status;
        request.start_time = start_time;
        request.end_time = end_time;
        Ok(())
    }
}
