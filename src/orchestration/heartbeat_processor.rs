//! # Heartbeat Processor
//!
//! Applies command reports coming back from agents. Reports for one task are
//! applied one at a time (a per-task async mutex), while reports for
//! different tasks proceed in parallel. The write itself is still a
//! versioned compare-and-set, which orders it against the scheduler's own
//! transitions (timeouts, aborts) without any global lock.
//!
//! Once a task is terminal further reports are ignored: duplicates and late
//! deliveries are expected and only logged.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::task_transitions::{try_transition, TransitionOutcome};
use crate::constants::events;
use crate::error::Result;
use crate::events::EventPublisher;
use crate::models::{CommandReport, HostRoleCommand, TaskId};
use crate::repository::TaskRepository;
use crate::state_machine::HostRoleStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreReason {
    UnknownTask,
    /// The task already reached a terminal status
    AlreadyTerminal,
    /// The report belongs to an earlier attempt
    StaleAttempt,
    /// The task is not waiting on an agent (pending, timed out or held)
    NotAwaitingReport,
    /// Report kept losing version races
    Contended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportOutcome {
    Applied {
        from: HostRoleStatus,
        to: HostRoleStatus,
    },
    Ignored {
        status: Option<HostRoleStatus>,
        reason: IgnoreReason,
    },
}

impl ReportOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

pub struct HeartbeatProcessor {
    repository: Arc<dyn TaskRepository>,
    events: EventPublisher,
    task_locks: DashMap<TaskId, Arc<Mutex<()>>>,
    conflict_retries: u32,
    wakeup: Option<Arc<Notify>>,
}

impl std::fmt::Debug for HeartbeatProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatProcessor")
            .field("locked_tasks", &self.task_locks.len())
            .field("conflict_retries", &self.conflict_retries)
            .finish_non_exhaustive()
    }
}

impl HeartbeatProcessor {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        events: EventPublisher,
        conflict_retries: u32,
    ) -> Self {
        Self {
            repository,
            events,
            task_locks: DashMap::new(),
            conflict_retries,
            wakeup: None,
        }
    }

    /// Wake the scheduler whenever a report resolves a task.
    pub fn with_scheduler_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    #[instrument(skip(self, report), fields(task_id = report.task_id, status = ?report.status))]
    pub async fn apply_report(&self, report: CommandReport) -> Result<ReportOutcome> {
        let lock = self
            .task_locks
            .entry(report.task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.apply_locked(&report).await
        };

        drop(lock);
        self.task_locks
            .remove_if(&report.task_id, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    async fn apply_locked(&self, report: &CommandReport) -> Result<ReportOutcome> {
        let event = report.to_event();

        for _ in 0..=self.conflict_retries {
            let Some(task) = self.repository.get_task(report.task_id).await? else {
                warn!(task_id = report.task_id, "Report for unknown task");
                return Ok(ReportOutcome::Ignored {
                    status: None,
                    reason: IgnoreReason::UnknownTask,
                });
            };

            if let Some(reason) = Self::ignore_reason(&task, report) {
                debug!(
                    task_id = task.task_id,
                    status = %task.status,
                    ?reason,
                    "Ignoring report"
                );
                return Ok(ReportOutcome::Ignored {
                    status: Some(task.status),
                    reason,
                });
            }

            match try_transition(self.repository.as_ref(), &task, &event, Utc::now()).await? {
                TransitionOutcome::Applied(updated) => {
                    self.after_applied(&task, &updated).await;
                    return Ok(ReportOutcome::Applied {
                        from: task.status,
                        to: updated.status,
                    });
                }
                TransitionOutcome::Conflict => continue,
                TransitionOutcome::NotFound => {
                    return Ok(ReportOutcome::Ignored {
                        status: None,
                        reason: IgnoreReason::UnknownTask,
                    });
                }
                TransitionOutcome::Rejected(err) => {
                    debug!(task_id = task.task_id, error = %err, "Report not applicable");
                    return Ok(ReportOutcome::Ignored {
                        status: Some(task.status),
                        reason: IgnoreReason::NotAwaitingReport,
                    });
                }
            }
        }

        warn!(
            task_id = report.task_id,
            retries = self.conflict_retries,
            "Report lost every version race"
        );
        Ok(ReportOutcome::Ignored {
            status: None,
            reason: IgnoreReason::Contended,
        })
    }

    fn ignore_reason(task: &HostRoleCommand, report: &CommandReport) -> Option<IgnoreReason> {
        if task.status.is_terminal() {
            return Some(IgnoreReason::AlreadyTerminal);
        }
        if report
            .attempt
            .is_some_and(|attempt| attempt < task.attempt_count)
        {
            return Some(IgnoreReason::StaleAttempt);
        }
        if !task.status.accepts_reports() {
            return Some(IgnoreReason::NotAwaitingReport);
        }
        None
    }

    async fn after_applied(&self, before: &HostRoleCommand, updated: &HostRoleCommand) {
        let name = match updated.status {
            HostRoleStatus::Completed => Some(events::TASK_COMPLETED),
            HostRoleStatus::Failed => Some(events::TASK_FAILED),
            HostRoleStatus::SkippedFailed => Some(events::TASK_SKIPPED),
            status if status.is_holding() => Some(events::TASK_HELD),
            _ => None,
        };
        if let Some(name) = name {
            info!(
                task_id = updated.task_id,
                from = %before.status,
                to = %updated.status,
                exit_code = ?updated.exit_code,
                "Task finished"
            );
            if let Err(err) = self.events.publish_task(name, updated).await {
                warn!(error = %err, "Failed to publish task event");
            }
        }

        if updated.is_resolved() || updated.status.is_holding() {
            if let Some(wakeup) = &self.wakeup {
                wakeup.notify_one();
            }
        }
    }

    /// Drain `reports` on a background task, one spawned handler per report
    /// so slow writes for one task never hold up the others.
    pub fn spawn_report_listener(
        self: Arc<Self>,
        mut reports: mpsc::Receiver<CommandReport>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                let processor = Arc::clone(&self);
                tokio::spawn(async move {
                    let task_id = report.task_id;
                    if let Err(err) = processor.apply_report(report).await {
                        warn!(task_id, error = %err, "Failed to apply report");
                    }
                });
            }
            debug!("Report channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Request, Role, RoleCommand, Stage};
    use crate::repository::InMemoryTaskRepository;
    use crate::state_machine::TaskEvent;

    async fn queued_task(repo: &InMemoryTaskRepository, attempts: u16) -> HostRoleCommand {
        let mut stage = Stage::new("c1", "Start");
        stage.policy.max_task_attempts = attempts;
        stage.add_task(HostRoleCommand::new(
            Some("h1".into()),
            Role::new("DATANODE"),
            RoleCommand::Start,
        ));
        stage.bind_tasks(1, 1);
        let stored = repo
            .persist(&Request::new(1, "c1", "Start"), vec![stage])
            .await
            .unwrap();
        try_transition(repo, &stored[0].tasks[0], &TaskEvent::Queue, Utc::now())
            .await
            .unwrap()
            .applied()
            .unwrap()
    }

    #[tokio::test]
    async fn test_completion_then_duplicate() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let task = queued_task(&repo, 1).await;
        let processor = HeartbeatProcessor::new(repo.clone(), EventPublisher::default(), 3);

        let outcome = processor
            .apply_report(CommandReport::completed(task.task_id, 0))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReportOutcome::Applied {
                from: HostRoleStatus::Queued,
                to: HostRoleStatus::Completed
            }
        );

        let duplicate = processor
            .apply_report(CommandReport::failed(task.task_id, 1, "late"))
            .await
            .unwrap();
        assert_eq!(
            duplicate,
            ReportOutcome::Ignored {
                status: Some(HostRoleStatus::Completed),
                reason: IgnoreReason::AlreadyTerminal
            }
        );
        let stored = repo.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.exit_code, Some(0));
        assert!(processor.task_locks.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_stale_reports_ignored() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let task = queued_task(&repo, 3).await;
        let processor = HeartbeatProcessor::new(repo.clone(), EventPublisher::default(), 3);

        let unknown = processor
            .apply_report(CommandReport::completed(999, 0))
            .await
            .unwrap();
        assert!(matches!(
            unknown,
            ReportOutcome::Ignored {
                reason: IgnoreReason::UnknownTask,
                ..
            }
        ));

        let mut retried = repo.get_task(task.task_id).await.unwrap().unwrap();
        retried.attempt_count = 2;
        repo.compare_and_set(&retried).await.unwrap();

        let stale = processor
            .apply_report(CommandReport::completed(task.task_id, 0).with_attempt(1))
            .await
            .unwrap();
        assert!(matches!(
            stale,
            ReportOutcome::Ignored {
                reason: IgnoreReason::StaleAttempt,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_progress_keeps_task_in_progress() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let task = queued_task(&repo, 1).await;
        let processor = HeartbeatProcessor::new(repo.clone(), EventPublisher::default(), 3);

        let mut report = CommandReport::in_progress(task.task_id);
        report.stdout = "50% done".into();
        processor.apply_report(report.clone()).await.unwrap();
        processor.apply_report(report).await.unwrap();

        let stored = repo.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, HostRoleStatus::InProgress);
        assert_eq!(stored.stdout, "50% done");
    }

    #[tokio::test]
    async fn test_resolving_report_wakes_scheduler() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let task = queued_task(&repo, 1).await;
        let wakeup = Arc::new(Notify::new());
        let processor = HeartbeatProcessor::new(repo.clone(), EventPublisher::default(), 3)
            .with_scheduler_wakeup(wakeup.clone());

        processor
            .apply_report(CommandReport::failed(task.task_id, 2, "disk full"))
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), wakeup.notified())
            .await
            .unwrap();
    }
}
