//! PostgreSQL task repository.
//!
//! Task compare-and-set is a single `UPDATE ... WHERE task_id = $1 AND
//! version = $2`, so concurrent schedulers in different processes still get
//! exactly one winner per transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    is_request_finished, CasResult, RepositoryError, RepositoryResult, TaskRepository,
};
use crate::config::DatabaseConfig;
use crate::models::{
    HostRoleCommand, Request, RequestId, Role, Stage, StageId, StagePolicy, TaskId,
};
use crate::state_machine::HostRoleStatus;

const TASK_COLUMNS: &str = "task_id, request_id, stage_id, host_name, role, role_command, \
     status, attempt_count, max_attempts, attempt_limit, last_attempt_time, start_time, \
     end_time, timeout_secs, command_detail, command_params, custom_command_name, \
     server_action_class, exit_code, stdout, stderr, structured_out, auto_skip_on_failure, \
     hold_on_failure, dispatch_error, version";

fn statuses_where(keep: impl Fn(HostRoleStatus) -> bool) -> Vec<String> {
    HostRoleStatus::ALL
        .into_iter()
        .filter(|status| keep(*status))
        .map(|status| status.as_str().to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "Connected task repository");
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> RepositoryResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn tasks_for_request_ordered(
        &self,
        request_id: RequestId,
    ) -> RepositoryResult<Vec<HostRoleCommand>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM host_role_commands WHERE request_id = $1 \
             ORDER BY stage_id, task_id"
        );
        let rows = sqlx::query(&sql)
            .bind(request_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }
}

fn corrupt(what: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Corrupt(what.to_string())
}

fn parse_status(raw: &str) -> RepositoryResult<HostRoleStatus> {
    raw.parse().map_err(corrupt)
}

fn small(value: i32, column: &str) -> RepositoryResult<u16> {
    u16::try_from(value).map_err(|_| corrupt(format!("{column} out of range: {value}")))
}

fn task_from_row(row: &PgRow) -> RepositoryResult<HostRoleCommand> {
    let role: String = row.try_get("role")?;
    let command: String = row.try_get("role_command")?;
    let status: String = row.try_get("status")?;
    let timeout_secs: i64 = row.try_get("timeout_secs")?;

    Ok(HostRoleCommand {
        task_id: row.try_get("task_id")?,
        request_id: row.try_get("request_id")?,
        stage_id: row.try_get("stage_id")?,
        host_name: row.try_get("host_name")?,
        role: Role::new(role),
        command: command.parse().map_err(corrupt)?,
        status: parse_status(&status)?,
        attempt_count: small(row.try_get("attempt_count")?, "attempt_count")?,
        max_attempts: small(row.try_get("max_attempts")?, "max_attempts")?,
        attempt_limit: small(row.try_get("attempt_limit")?, "attempt_limit")?,
        last_attempt_time: row.try_get("last_attempt_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        timeout_secs: u64::try_from(timeout_secs)
            .map_err(|_| corrupt(format!("negative timeout: {timeout_secs}")))?,
        command_detail: row.try_get("command_detail")?,
        command_params: row.try_get("command_params")?,
        custom_command_name: row.try_get("custom_command_name")?,
        server_action_class: row.try_get("server_action_class")?,
        exit_code: row.try_get("exit_code")?,
        stdout: row.try_get("stdout")?,
        stderr: row.try_get("stderr")?,
        structured_out: row.try_get("structured_out")?,
        auto_skip_on_failure: row.try_get("auto_skip_on_failure")?,
        hold_on_failure: row.try_get("hold_on_failure")?,
        dispatch_error: row.try_get("dispatch_error")?,
        version: row.try_get("version")?,
    })
}

fn stage_from_row(row: &PgRow) -> RepositoryResult<Stage> {
    let policy: Value = row.try_get("policy")?;
    let status: String = row.try_get("status")?;
    Ok(Stage {
        request_id: row.try_get("request_id")?,
        stage_id: row.try_get("stage_id")?,
        context: row.try_get("context")?,
        cluster_name: row.try_get("cluster_name")?,
        command_params: row.try_get("command_params")?,
        host_params: row.try_get("host_params")?,
        policy: serde_json::from_value::<StagePolicy>(policy)?,
        tasks: Vec::new(),
        status: parse_status(&status)?,
        created_at: row.try_get("created_at")?,
    })
}

fn request_from_row(row: &PgRow, stage_ids: Vec<StageId>) -> RepositoryResult<Request> {
    let status: String = row.try_get("status")?;
    Ok(Request {
        request_id: row.try_get("request_id")?,
        cluster_name: row.try_get("cluster_name")?,
        context: row.try_get("context")?,
        created_at: row.try_get("created_at")?,
        exclusive: row.try_get("exclusive")?,
        stage_ids,
        status: parse_status(&status)?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
    })
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn next_request_id(&self) -> RepositoryResult<RequestId> {
        let row = sqlx::query("SELECT nextval('request_id_seq') AS id")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn persist(
        &self,
        request: &Request,
        stages: Vec<Stage>,
    ) -> RepositoryResult<Vec<Stage>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO requests (request_id, cluster_name, context, created_at, exclusive, \
             status, start_time, end_time) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (request_id) DO UPDATE SET context = EXCLUDED.context, \
             exclusive = EXCLUDED.exclusive",
        )
        .bind(request.request_id)
        .bind(&request.cluster_name)
        .bind(&request.context)
        .bind(request.created_at)
        .bind(request.exclusive)
        .bind(request.status.as_str())
        .bind(request.start_time)
        .bind(request.end_time)
        .execute(&mut *tx)
        .await?;

        let mut persisted = Vec::with_capacity(stages.len());
        for mut stage in stages {
            stage.request_id = request.request_id;
            let inserted = sqlx::query(
                "INSERT INTO stages (request_id, stage_id, context, cluster_name, \
                 command_params, host_params, policy, status, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT DO NOTHING",
            )
            .bind(stage.request_id)
            .bind(stage.stage_id)
            .bind(&stage.context)
            .bind(&stage.cluster_name)
            .bind(&stage.command_params)
            .bind(&stage.host_params)
            .bind(serde_json::to_value(&stage.policy)?)
            .bind(stage.status.as_str())
            .bind(stage.created_at)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                return Err(RepositoryError::DuplicateStage {
                    request_id: stage.request_id,
                    stage_id: stage.stage_id,
                });
            }

            for task in &mut stage.tasks {
                task.request_id = stage.request_id;
                task.stage_id = stage.stage_id;
                let row = sqlx::query(
                    "INSERT INTO host_role_commands (request_id, stage_id, host_name, role, \
                     role_command, status, attempt_count, max_attempts, attempt_limit, \
                     timeout_secs, command_detail, command_params, custom_command_name, \
                     server_action_class, auto_skip_on_failure, hold_on_failure, version) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                     $15, $16, $17) RETURNING task_id",
                )
                .bind(task.request_id)
                .bind(task.stage_id)
                .bind(&task.host_name)
                .bind(task.role.as_str())
                .bind(task.command.as_str())
                .bind(task.status.as_str())
                .bind(i32::from(task.attempt_count))
                .bind(i32::from(task.max_attempts))
                .bind(i32::from(task.attempt_limit))
                .bind(i64::try_from(task.timeout_secs).unwrap_or(i64::MAX))
                .bind(&task.command_detail)
                .bind(&task.command_params)
                .bind(&task.custom_command_name)
                .bind(&task.server_action_class)
                .bind(task.auto_skip_on_failure)
                .bind(task.hold_on_failure)
                .bind(task.version)
                .fetch_one(&mut *tx)
                .await?;
                task.task_id = row.try_get("task_id")?;
            }
            persisted.push(stage);
        }

        tx.commit().await?;
        debug!(
            request_id = request.request_id,
            stages = persisted.len(),
            "Persisted request stages"
        );
        Ok(persisted)
    }

    async fn get_request(&self, request_id: RequestId) -> RepositoryResult<Option<Request>> {
        let Some(row) = sqlx::query("SELECT * FROM requests WHERE request_id = $1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let stage_ids: Vec<StageId> = sqlx::query(
            "SELECT stage_id FROM stages WHERE request_id = $1 ORDER BY stage_id",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| r.try_get("stage_id"))
        .collect::<Result<_, _>>()?;
        request_from_row(&row, stage_ids).map(Some)
    }

    async fn get_stage(
        &self,
        request_id: RequestId,
        stage_id: StageId,
    ) -> RepositoryResult<Option<Stage>> {
        let Some(row) = sqlx::query("SELECT * FROM stages WHERE request_id = $1 AND stage_id = $2")
            .bind(request_id)
            .bind(stage_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let mut stage = stage_from_row(&row)?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM host_role_commands \
             WHERE request_id = $1 AND stage_id = $2 ORDER BY task_id"
        );
        stage.tasks = sqlx::query(&sql)
            .bind(request_id)
            .bind(stage_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(task_from_row)
            .collect::<RepositoryResult<_>>()?;
        Ok(Some(stage))
    }

    async fn get_task(&self, task_id: TaskId) -> RepositoryResult<Option<HostRoleCommand>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM host_role_commands WHERE task_id = $1");
        sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(task_from_row)
            .transpose()
    }

    async fn stages_for_request(&self, request_id: RequestId) -> RepositoryResult<Vec<Stage>> {
        let mut stages: BTreeMap<StageId, Stage> = BTreeMap::new();
        for row in sqlx::query("SELECT * FROM stages WHERE request_id = $1 ORDER BY stage_id")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await?
        {
            let stage = stage_from_row(&row)?;
            stages.insert(stage.stage_id, stage);
        }
        for task in self.tasks_for_request_ordered(request_id).await? {
            if let Some(stage) = stages.get_mut(&task.stage_id) {
                stage.tasks.push(task);
            }
        }
        Ok(stages.into_values().collect())
    }

    async fn tasks_for_request(
        &self,
        request_id: RequestId,
    ) -> RepositoryResult<Vec<HostRoleCommand>> {
        let mut tasks = self.tasks_for_request_ordered(request_id).await?;
        tasks.sort_by_key(|task| task.task_id);
        Ok(tasks)
    }

    async fn non_terminal_tasks(&self) -> RepositoryResult<Vec<HostRoleCommand>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM host_role_commands WHERE status <> ALL($1) \
             ORDER BY task_id"
        );
        let rows = sqlx::query(&sql)
            .bind(statuses_where(|status| status.is_terminal()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn active_request_ids(&self) -> RepositoryResult<Vec<RequestId>> {
        let rows = sqlx::query(
            "SELECT request_id FROM requests WHERE status <> ALL($1) ORDER BY request_id",
        )
        .bind(statuses_where(is_request_finished))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("request_id").map_err(RepositoryError::from))
            .collect()
    }

    async fn compare_and_set(&self, task: &HostRoleCommand) -> RepositoryResult<CasResult> {
        let updated = sqlx::query(
            "UPDATE host_role_commands SET status = $3, attempt_count = $4, max_attempts = $5, \
             attempt_limit = $6, last_attempt_time = $7, start_time = $8, end_time = $9, \
             exit_code = $10, stdout = $11, stderr = $12, structured_out = $13, \
             dispatch_error = $14, auto_skip_on_failure = $15, hold_on_failure = $16, \
             version = version + 1 \
             WHERE task_id = $1 AND version = $2 RETURNING version",
        )
        .bind(task.task_id)
        .bind(task.version)
        .bind(task.status.as_str())
        .bind(i32::from(task.attempt_count))
        .bind(i32::from(task.max_attempts))
        .bind(i32::from(task.attempt_limit))
        .bind(task.last_attempt_time)
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(task.exit_code)
        .bind(&task.stdout)
        .bind(&task.stderr)
        .bind(&task.structured_out)
        .bind(&task.dispatch_error)
        .bind(task.auto_skip_on_failure)
        .bind(task.hold_on_failure)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(CasResult::Success {
                version: row.try_get("version")?,
            });
        }

        let current = sqlx::query("SELECT version FROM host_role_commands WHERE task_id = $1")
            .bind(task.task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match current {
            Some(row) => CasResult::VersionConflict {
                actual: row.try_get("version")?,
            },
            None => CasResult::NotFound,
        })
    }

    async fn update_stage_status(
        &self,
        request_id: RequestId,
        stage_id: StageId,
        status: HostRoleStatus,
    ) -> RepositoryResult<()> {
        let result =
            sqlx::query("UPDATE stages SET status = $3 WHERE request_id = $1 AND stage_id = $2")
                .bind(request_id)
                .bind(stage_id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "stage",
                id: format!("{request_id}-{stage_id}"),
            });
        }
        Ok(())
    }

    async fn update_request_status(
        &self,
        request_id: RequestId,
        status: HostRoleStatus,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE requests SET status = $2, start_time = $3, end_time = $4 \
             WHERE request_id = $1",
        )
        .bind(request_id)
        .bind(status.as_str())
        .bind(start_time)
        .bind(end_time)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "request",
                id: request_id.to_string(),
            });
        }
        Ok(())
    }
}
