//! Turns a queued task into the execution command sent to its host.

use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{ExecutionCommand, HostRoleCommand, Stage};
use crate::topology::ClusterTopology;

#[derive(Clone)]
pub struct CommandBuilder {
    topology: Arc<dyn ClusterTopology>,
}

impl std::fmt::Debug for CommandBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuilder").finish_non_exhaustive()
    }
}

impl CommandBuilder {
    pub fn new(topology: Arc<dyn ClusterTopology>) -> Self {
        Self { topology }
    }

    /// Command parameters are the stage's shared parameters overlaid with the
    /// task's own; host parameters are the stage's overlaid with the
    /// topology's view of the host.
    pub fn build(&self, stage: &Stage, task: &HostRoleCommand) -> ExecutionCommand {
        let host_params = match task.host_name.as_deref() {
            Some(host) => merge_objects(&stage.host_params, &self.topology.host_params(host)),
            None => stage.host_params.clone(),
        };

        ExecutionCommand {
            correlation_id: Uuid::new_v4(),
            cluster_name: stage.cluster_name.clone(),
            request_id: task.request_id,
            stage_id: task.stage_id,
            task_id: task.task_id,
            attempt: task.attempt_count,
            host_name: task.host_name.clone(),
            role: task.role.clone(),
            command: task.command,
            custom_command_name: task.custom_command_name.clone(),
            server_action_class: task.server_action_class.clone(),
            timeout_secs: task.timeout_secs,
            command_params: merge_objects(&stage.command_params, &task.command_params),
            host_params,
        }
    }
}

/// Shallow merge: top-level keys of `overlay` replace those of `base`.
/// A non-object overlay is ignored unless `base` is not an object either.
pub fn merge_objects(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (Value::Object(_), _) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}
