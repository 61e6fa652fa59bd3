use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::role::Role;
use super::task::HostRoleCommand;
use super::{RequestId, StageId};
use crate::constants::{DEFAULT_MAX_TASK_ATTEMPTS, DEFAULT_SUCCESS_FACTOR};
use crate::state_machine::HostRoleStatus;

/// Failure tolerance and retry budget for the tasks of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    /// Fraction of a role's tasks that must succeed, in `[0, 1]`
    pub success_factor: f64,
    /// Per-role overrides of `success_factor`
    pub role_success_factors: HashMap<Role, f64>,
    /// Task failures never block downstream stages
    pub skippable: bool,
    /// Failures and exhausted timeouts wait for an operator
    pub hold_on_failure: bool,
    pub max_task_attempts: u16,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            success_factor: DEFAULT_SUCCESS_FACTOR,
            role_success_factors: HashMap::new(),
            skippable: false,
            hold_on_failure: false,
            max_task_attempts: DEFAULT_MAX_TASK_ATTEMPTS,
        }
    }
}

impl StagePolicy {
    pub fn success_factor_for(&self, role: &Role) -> f64 {
        self.role_success_factors
            .get(role)
            .copied()
            .unwrap_or(self.success_factor)
            .clamp(0.0, 1.0)
    }
}

/// A batch of tasks that may run in parallel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub request_id: RequestId,
    pub stage_id: StageId,
    pub context: String,
    pub cluster_name: String,
    /// Configuration snapshot shared by every task in the stage
    pub command_params: Value,
    /// Host-level parameters shared by every task in the stage
    pub host_params: Value,
    pub policy: StagePolicy,
    pub tasks: Vec<HostRoleCommand>,
    pub status: HostRoleStatus,
    pub created_at: DateTime<Utc>,
}

impl Stage {
    pub fn new(cluster_name: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            stage_id: 0,
            context: context.into(),
            cluster_name: cluster_name.into(),
            command_params: Value::Object(Default::default()),
            host_params: Value::Object(Default::default()),
            policy: StagePolicy::default(),
            tasks: Vec::new(),
            status: HostRoleStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Copy of this stage's metadata with no tasks.
    pub fn template(&self) -> Self {
        Self {
            tasks: Vec::new(),
            status: HostRoleStatus::Pending,
            ..self.clone()
        }
    }

    pub fn add_task(&mut self, task: HostRoleCommand) {
        self.tasks.push(task);
    }

    /// Assign identity and policy-derived attempt settings to every task.
    pub fn bind_tasks(&mut self, request_id: RequestId, stage_id: StageId) {
        self.request_id = request_id;
        self.stage_id = stage_id;
        let attempts = self.policy.max_task_attempts.max(1);
        for task in &mut self.tasks {
            task.request_id = request_id;
            task.stage_id = stage_id;
            task.max_attempts = attempts;
            task.attempt_limit = task.attempt_count.saturating_add(attempts);
            task.auto_skip_on_failure = task.auto_skip_on_failure || self.policy.skippable;
            task.hold_on_failure = self.policy.hold_on_failure;
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().filter_map(|task| task.host_name.as_deref())
    }
}

/// Count of tasks per status plus timing for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStatusSummary {
    pub stage_id: StageId,
    pub counts: HashMap<HostRoleStatus, usize>,
    pub total: usize,
    pub skippable: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl StageStatusSummary {
    pub fn from_stage(stage: &Stage) -> Self {
        let mut summary = Self {
            stage_id: stage.stage_id,
            total: stage.tasks.len(),
            skippable: stage.policy.skippable,
            ..Default::default()
        };
        for task in &stage.tasks {
            *summary.counts.entry(task.status).or_default() += 1;
            summary.start_time = min_time(summary.start_time, task.start_time);
            summary.end_time = max_time(summary.end_time, task.end_time);
        }
        summary
    }

    pub fn count(&self, status: HostRoleStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn completed_or_skipped(&self) -> usize {
        self.count(HostRoleStatus::Completed) + self.count(HostRoleStatus::SkippedFailed)
    }
}

fn min_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
