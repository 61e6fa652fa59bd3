use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{Request, RequestId, Stage, StageId};
use crate::ordering::{RoleGraph, RoleOrderingRules};
use crate::repository::TaskRepository;
use crate::topology::ClusterTopology;

/// Collects the stages of one request and persists them together.
///
/// Stage ids are assigned here: every added stage gets `last_stage_id() + 1`.
pub struct RequestStageContainer {
    request: Request,
    last_stage_id: StageId,
    pending: Vec<Stage>,
    repository: Arc<dyn TaskRepository>,
}

impl RequestStageContainer {
    pub fn new(request: Request, repository: Arc<dyn TaskRepository>) -> Self {
        Self {
            request,
            last_stage_id: 0,
            pending: Vec::new(),
            repository,
        }
    }

    /// Container for a brand-new request with a freshly allocated id.
    pub async fn create(
        repository: Arc<dyn TaskRepository>,
        cluster_name: &str,
        context: &str,
    ) -> Result<Self> {
        let request_id = repository.next_request_id().await?;
        Ok(Self::new(
            Request::new(request_id, cluster_name, context),
            repository,
        ))
    }

    /// Continue adding stages to an already persisted request.
    pub fn resume(
        request: Request,
        last_stage_id: StageId,
        repository: Arc<dyn TaskRepository>,
    ) -> Self {
        Self {
            request,
            last_stage_id,
            pending: Vec::new(),
            repository,
        }
    }

    pub fn id(&self) -> RequestId {
        self.request.request_id
    }

    pub fn cluster_name(&self) -> &str {
        &self.request.cluster_name
    }

    /// Id of the most recently added stage, 0 when none was added.
    pub fn last_stage_id(&self) -> StageId {
        self.last_stage_id
    }

    pub fn set_exclusive(&mut self, exclusive: bool) {
        self.request.exclusive = exclusive;
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Stages added since the last `persist`.
    pub fn stages(&self) -> &[Stage] {
        &self.pending
    }

    pub fn add_stage(&mut self, mut stage: Stage) -> StageId {
        self.last_stage_id += 1;
        stage.request_id = self.request.request_id;
        stage.stage_id = self.last_stage_id;
        debug!(
            request_id = self.request.request_id,
            stage_id = stage.stage_id,
            context = %stage.context,
            tasks = stage.tasks.len(),
            "Added stage"
        );
        self.pending.push(stage);
        self.last_stage_id
    }

    pub fn add_stages(&mut self, stages: impl IntoIterator<Item = Stage>) {
        for stage in stages {
            self.add_stage(stage);
        }
    }

    /// Store the request and every pending stage.
    ///
    /// Returns `None` without touching the repository when no stage was added.
    pub async fn persist(&mut self) -> Result<Option<Request>> {
        if self.pending.is_empty() {
            debug!(request_id = self.request.request_id, "No stages to persist");
            return Ok(None);
        }

        let mut stages = std::mem::take(&mut self.pending);
        for stage in &mut stages {
            stage.bind_tasks(self.request.request_id, stage.stage_id);
        }
        self.request
            .stage_ids
            .extend(stages.iter().map(|stage| stage.stage_id));

        let stored = self.repository.persist(&self.request, stages).await?;
        info!(
            request_id = self.request.request_id,
            stages = stored.len(),
            tasks = stored.iter().map(|s| s.tasks.len()).sum::<usize>(),
            "Persisted request"
        );
        Ok(Some(self.request.clone()))
    }
}

/// Stage container that splits every added stage by role command order and
/// drops commands aimed at hosts that left the cluster.
pub struct OrderedRequestStageContainer {
    inner: RequestStageContainer,
    rules: Arc<RoleOrderingRules>,
    topology: Arc<dyn ClusterTopology>,
}

impl OrderedRequestStageContainer {
    pub fn new(
        inner: RequestStageContainer,
        rules: Arc<RoleOrderingRules>,
        topology: Arc<dyn ClusterTopology>,
    ) -> Self {
        Self {
            inner,
            rules,
            topology,
        }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id()
    }

    pub fn last_stage_id(&self) -> StageId {
        self.inner.last_stage_id()
    }

    pub fn stages(&self) -> &[Stage] {
        self.inner.stages()
    }

    /// Partition `stage` and append the resulting stages. Returns their ids.
    pub fn add_stage(&mut self, mut stage: Stage) -> Result<Vec<StageId>> {
        let before = stage.tasks.len();
        let topology = Arc::clone(&self.topology);
        stage.tasks.retain(|task| match task.host_name.as_deref() {
            Some(host) => topology.host_exists(host),
            None => true,
        });
        if stage.tasks.len() < before {
            warn!(
                request_id = self.inner.id(),
                context = %stage.context,
                dropped = before - stage.tasks.len(),
                "Dropped commands for hosts no longer in the cluster"
            );
        }

        stage.stage_id = self.inner.last_stage_id();
        let partitioned = RoleGraph::partition_stage(stage, &self.rules)?;
        Ok(partitioned
            .into_iter()
            .map(|stage| self.inner.add_stage(stage))
            .collect())
    }

    pub async fn persist(&mut self) -> Result<Option<Request>> {
        self.inner.persist().await
    }

    pub fn inner_mut(&mut self) -> &mut RequestStageContainer {
        &mut self.inner
    }
}
