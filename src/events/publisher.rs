use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::models::{HostRoleCommand, RequestId, StageId};
use crate::state_machine::HostRoleStatus;

/// Broadcast publisher for orchestration lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event with the given name and context
    pub async fn publish(
        &self,
        event_name: impl Into<String>,
        context: Value,
    ) -> Result<(), PublishError> {
        let event = PublishedEvent {
            name: event_name.into(),
            context,
            published_at: Utc::now(),
        };

        // No subscribers is fine: events are advisory
        match self.sender.send(event) {
            Ok(_) => Ok(()),
            Err(broadcast::error::SendError(_)) => Ok(()),
        }
    }

    pub async fn publish_task(
        &self,
        event_name: &str,
        task: &HostRoleCommand,
    ) -> Result<(), PublishError> {
        self.publish(
            event_name,
            json!({
                "task_id": task.task_id,
                "request_id": task.request_id,
                "stage_id": task.stage_id,
                "host_name": task.host_name,
                "role": task.role,
                "command": task.command,
                "status": task.status,
                "attempt": task.attempt_count,
            }),
        )
        .await
    }

    pub async fn publish_stage_status(
        &self,
        request_id: RequestId,
        stage_id: StageId,
        from: HostRoleStatus,
        to: HostRoleStatus,
    ) -> Result<(), PublishError> {
        self.publish(
            crate::constants::events::STAGE_STATUS_CHANGED,
            json!({
                "request_id": request_id,
                "stage_id": stage_id,
                "from": from,
                "to": to,
            }),
        )
        .await
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event channel is closed")]
    ChannelClosed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
