use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RequestId, StageId};
use crate::state_machine::HostRoleStatus;

/// A user-visible operation, executed as an ordered list of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub cluster_name: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    /// No other request on the same cluster runs while this one is active
    pub exclusive: bool,
    pub stage_ids: Vec<StageId>,
    /// Cached aggregate, written only by status aggregation
    pub status: HostRoleStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(
        request_id: RequestId,
        cluster_name: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            cluster_name: cluster_name.into(),
            context: context.into(),
            created_at: Utc::now(),
            exclusive: false,
            stage_ids: Vec::new(),
            status: HostRoleStatus::Pending,
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}
