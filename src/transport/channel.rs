use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;
use tracing::debug;

use super::{CommandTransport, DispatchAck, TransportError};
use crate::models::{ExecutionCommand, TaskId};

/// Sends commands into a tokio mpsc channel drained by an agent gateway.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<ExecutionCommand>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::Sender<ExecutionCommand>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ExecutionCommand>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl CommandTransport for ChannelTransport {
    async fn dispatch(&self, command: ExecutionCommand) -> Result<DispatchAck, TransportError> {
        // A full channel is backpressure, not a failure: report it so the
        // command is redelivered on a later tick instead of blocking the tick.
        self.sender.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(command) => TransportError::Rejected(format!(
                "queue full for task {}",
                command.task_id
            )),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })?;
        Ok(DispatchAck::Accepted)
    }
}

/// Records every dispatched command. Hosts can be marked unreachable and
/// individual failures queued up.
#[derive(Debug)]
pub struct RecordingTransport {
    ack: DispatchAck,
    sent: Mutex<Vec<ExecutionCommand>>,
    unreachable: Mutex<HashSet<String>>,
    scripted_failures: Mutex<VecDeque<TransportError>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new(DispatchAck::Accepted)
    }
}

impl RecordingTransport {
    pub fn new(ack: DispatchAck) -> Self {
        Self {
            ack,
            sent: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn mark_unreachable(&self, host: impl Into<String>) {
        self.unreachable.lock().insert(host.into());
    }

    pub fn mark_reachable(&self, host: &str) {
        self.unreachable.lock().remove(host);
    }

    /// Fail the next dispatch with `error`, whatever its target.
    pub fn fail_next(&self, error: TransportError) {
        self.scripted_failures.lock().push_back(error);
    }

    pub fn sent(&self) -> Vec<ExecutionCommand> {
        self.sent.lock().clone()
    }

    pub fn sent_task_ids(&self) -> Vec<TaskId> {
        self.sent.lock().iter().map(|c| c.task_id).collect()
    }

    pub fn dispatch_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl CommandTransport for RecordingTransport {
    async fn dispatch(&self, command: ExecutionCommand) -> Result<DispatchAck, TransportError> {
        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(host) = command.host_name.as_deref() {
            if self.unreachable.lock().contains(host) {
                return Err(TransportError::Unreachable(host.to_string()));
            }
        }
        debug!(task_id = command.task_id, attempt = command.attempt, "Recorded dispatch");
        self.sent.lock().push(command);
        Ok(self.ack)
    }
}
