//! # Task Repository
//!
//! Persistence port for requests, stages and host role commands.
//!
//! ## Overview
//!
//! The scheduler, the report ingestor and the request facade never share
//! in-memory task state. Every task change is a versioned compare-and-set
//! against the repository: the write succeeds only if the stored `version`
//! still equals the version the caller read, and the stored version then
//! moves forward by one. Whoever loses the race reloads and decides again.
//!
//! Stage and request statuses stored here are caches of the aggregation in
//! `orchestration::status_aggregator` and can be recomputed at any time.
//!
//! ## Implementations
//!
//! - [`memory::InMemoryTaskRepository`]: `DashMap` backed, for tests and
//!   single-process deployments
//! - [`postgres::PgTaskRepository`]: durable, behind the `postgres` feature

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::OrchestratorError;
use crate::models::{
    HostRoleCommand, Request, RequestId, Stage, StageId, StageStatusSummary, TaskId,
};
use crate::state_machine::HostRoleStatus;

pub use memory::InMemoryTaskRepository;
#[cfg(feature = "postgres")]
pub use postgres::PgTaskRepository;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Stage {stage_id} already exists for request {request_id}")]
    DuplicateStage {
        request_id: RequestId,
        stage_id: StageId,
    },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

impl From<RepositoryError> for OrchestratorError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => OrchestratorError::NotFound { entity, id },
            other => OrchestratorError::Repository(other.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}

/// Outcome of a versioned task write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Written; the stored task now carries `version`
    Success { version: i64 },
    NotFound,
    /// Someone else wrote first
    VersionConflict { actual: i64 },
}

impl CasResult {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Status of a finished request. The scheduler only revisits such a request
/// while it still has unresolved tasks.
pub fn is_request_finished(status: HostRoleStatus) -> bool {
    matches!(
        status,
        HostRoleStatus::Completed
            | HostRoleStatus::Failed
            | HostRoleStatus::TimedOut
            | HostRoleStatus::Aborted
            | HostRoleStatus::SkippedFailed
    )
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Next unused request id; ids increase monotonically.
    async fn next_request_id(&self) -> RepositoryResult<RequestId>;

    /// Store `request` (insert or update) and insert `stages`, assigning task
    /// ids. Returns the stages as stored.
    async fn persist(&self, request: &Request, stages: Vec<Stage>)
        -> RepositoryResult<Vec<Stage>>;

    async fn get_request(&self, request_id: RequestId) -> RepositoryResult<Option<Request>>;

    /// Stage with a fresh snapshot of its tasks.
    async fn get_stage(
        &self,
        request_id: RequestId,
        stage_id: StageId,
    ) -> RepositoryResult<Option<Stage>>;

    async fn get_task(&self, task_id: TaskId) -> RepositoryResult<Option<HostRoleCommand>>;

    /// All stages of a request ordered by stage id, with task snapshots.
    async fn stages_for_request(&self, request_id: RequestId) -> RepositoryResult<Vec<Stage>>;

    async fn tasks_for_request(
        &self,
        request_id: RequestId,
    ) -> RepositoryResult<Vec<HostRoleCommand>>;

    /// Tasks whose status is not terminal, across all requests.
    async fn non_terminal_tasks(&self) -> RepositoryResult<Vec<HostRoleCommand>>;

    /// Ids of requests that are not finished, ascending.
    async fn active_request_ids(&self) -> RepositoryResult<Vec<RequestId>>;

    /// Replace the stored task if its version equals `task.version`.
    async fn compare_and_set(&self, task: &HostRoleCommand) -> RepositoryResult<CasResult>;

    async fn update_stage_status(
        &self,
        request_id: RequestId,
        stage_id: StageId,
        status: HostRoleStatus,
    ) -> RepositoryResult<()>;

    async fn update_request_status(
        &self,
        request_id: RequestId,
        status: HostRoleStatus,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()>;

    /// Per-stage status counts for a request, ordered by stage id.
    async fn stage_summaries(
        &self,
        request_id: RequestId,
    ) -> RepositoryResult<Vec<StageStatusSummary>> {
        Ok(self
            .stages_for_request(request_id)
            .await?
            .iter()
            .map(StageStatusSummary::from_stage)
            .collect())
    }
}
