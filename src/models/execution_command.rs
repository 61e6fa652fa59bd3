use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::role::{Role, RoleCommand};
use super::{RequestId, StageId, TaskId};

/// Payload handed to the transport for one task attempt. Built at dispatch
/// time from the stage and task and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCommand {
    pub correlation_id: Uuid,
    pub cluster_name: String,
    pub request_id: RequestId,
    pub stage_id: StageId,
    pub task_id: TaskId,
    pub attempt: u16,
    pub host_name: Option<String>,
    pub role: Role,
    pub command: RoleCommand,
    pub custom_command_name: Option<String>,
    pub server_action_class: Option<String>,
    pub timeout_secs: u64,
    /// Stage parameters overlaid with the task's own
    pub command_params: Value,
    /// Stage host parameters overlaid with topology facts for the host
    pub host_params: Value,
}

impl ExecutionCommand {
    pub fn is_server_action(&self) -> bool {
        self.host_name.is_none()
    }
}
