//! Agent report ingestion: idempotence, ordering races and the background
//! listener.

mod common;

use std::sync::Arc;
use std::time::Duration;

use clusterops_core::models::{CommandReport, ReportedStatus};
use clusterops_core::orchestration::{IgnoreReason, ReportOutcome};
use clusterops_core::state_machine::HostRoleStatus;
use common::TestCluster;
use futures::future::join_all;
use tokio::sync::mpsc;

async fn dispatched(cluster: &TestCluster, hosts: &[&str]) -> Vec<i64> {
    cluster.submit_stages(&[("DATANODE", hosts)]).await;
    cluster.scheduler.tick().await.unwrap();
    cluster.transport.sent_task_ids()
}

#[tokio::test]
async fn test_duplicate_report_is_a_no_op() {
    let cluster = TestCluster::new(&["h1"]);
    let task_id = dispatched(&cluster, &["h1"]).await[0];

    let report = CommandReport::completed(task_id, 0);
    let first = cluster.reports.apply_report(report.clone()).await.unwrap();
    assert_eq!(
        first,
        ReportOutcome::Applied {
            from: HostRoleStatus::Queued,
            to: HostRoleStatus::Completed,
        }
    );
    let after_first = cluster.task(task_id).await;

    let second = cluster.reports.apply_report(report).await.unwrap();
    assert_eq!(
        second,
        ReportOutcome::Ignored {
            status: Some(HostRoleStatus::Completed),
            reason: IgnoreReason::AlreadyTerminal,
        }
    );
    let after_second = cluster.task(task_id).await;
    assert_eq!(after_first.version, after_second.version);
    assert_eq!(after_second.exit_code, Some(0));
}

#[tokio::test]
async fn test_first_terminal_report_wins() {
    let cluster = TestCluster::new(&["h1"]);
    let task_id = dispatched(&cluster, &["h1"]).await[0];

    cluster
        .reports
        .apply_report(CommandReport::completed(task_id, 0))
        .await
        .unwrap();
    let late = cluster
        .reports
        .apply_report(CommandReport::failed(task_id, 2, "late failure"))
        .await
        .unwrap();
    assert!(!late.is_applied());

    let task = cluster.task(task_id).await;
    assert_eq!(task.status, HostRoleStatus::Completed);
    assert!(!task.stderr.contains("late failure"));
}

#[tokio::test]
async fn test_progress_then_completion_keeps_output() {
    let cluster = TestCluster::new(&["h1"]);
    let task_id = dispatched(&cluster, &["h1"]).await[0];

    let mut progress = CommandReport::in_progress(task_id);
    progress.stdout = "starting datanode".into();
    let outcome = cluster.reports.apply_report(progress).await.unwrap();
    assert_eq!(
        outcome,
        ReportOutcome::Applied {
            from: HostRoleStatus::Queued,
            to: HostRoleStatus::InProgress,
        }
    );

    let mut done = CommandReport::completed(task_id, 0);
    done.stdout = "datanode started".into();
    cluster.reports.apply_report(done).await.unwrap();

    let task = cluster.task(task_id).await;
    assert_eq!(task.status, HostRoleStatus::Completed);
    assert!(task.stdout.contains("datanode started"));
    assert!(task.end_time.is_some());
}

#[tokio::test]
async fn test_reports_for_unknown_or_pending_tasks_are_ignored() {
    let cluster = TestCluster::new(&["h1"]);
    let request_id = cluster.submit_stages(&[("DATANODE", &["h1"][..])]).await;
    let pending = cluster.tasks(request_id).await[0].task_id;

    let unknown = cluster
        .reports
        .apply_report(CommandReport::completed(9_999, 0))
        .await
        .unwrap();
    assert_eq!(
        unknown,
        ReportOutcome::Ignored {
            status: None,
            reason: IgnoreReason::UnknownTask,
        }
    );

    let early = cluster
        .reports
        .apply_report(CommandReport::completed(pending, 0))
        .await
        .unwrap();
    assert_eq!(
        early,
        ReportOutcome::Ignored {
            status: Some(HostRoleStatus::Pending),
            reason: IgnoreReason::NotAwaitingReport,
        }
    );
}

#[tokio::test]
async fn test_holding_report_parks_a_queued_task() {
    let cluster = TestCluster::new(&["h1"]);
    let task_id = dispatched(&cluster, &["h1"]).await[0];

    let outcome = cluster
        .reports
        .apply_report(CommandReport::new(task_id, ReportedStatus::Holding))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReportOutcome::Applied {
            from: HostRoleStatus::Queued,
            to: HostRoleStatus::Holding,
        }
    );
    assert_eq!(cluster.task(task_id).await.status, HostRoleStatus::Holding);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reports_apply_one_terminal_status() {
    let cluster = TestCluster::new(&["h1"]);
    let task_id = dispatched(&cluster, &["h1"]).await[0];

    let reports: Vec<CommandReport> = (0..16)
        .map(|i| {
            if i % 2 == 0 {
                CommandReport::completed(task_id, 0)
            } else {
                CommandReport::failed(task_id, 1, "boom")
            }
        })
        .collect();
    let outcomes = join_all(
        reports
            .into_iter()
            .map(|report| cluster.reports.apply_report(report)),
    )
    .await;

    let applied = outcomes
        .into_iter()
        .map(Result::unwrap)
        .filter(ReportOutcome::is_applied)
        .count();
    assert_eq!(applied, 1);
    assert!(cluster.task(task_id).await.status.is_terminal());
}

#[tokio::test]
async fn test_held_failure_waits_for_operator() {
    let mut config = clusterops_core::config::OrchestratorConfig::default();
    config.stage_defaults.hold_on_failure = true;
    let cluster = TestCluster::with_config(
        &["h1"],
        config,
        clusterops_core::ordering::RoleOrderingRules::default(),
    );
    let request_id = cluster
        .submit_stages(&[("DATANODE", &["h1"][..]), ("NODEMANAGER", &["h1"][..])])
        .await;
    cluster.scheduler.tick().await.unwrap();
    let task_id = cluster.transport.sent_task_ids()[0];

    let outcome = cluster
        .reports
        .apply_report(CommandReport::failed(task_id, 1, "bad config"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReportOutcome::Applied {
            from: HostRoleStatus::Queued,
            to: HostRoleStatus::HoldingFailed,
        }
    );

    let summary = cluster.scheduler.tick().await.unwrap();
    assert_eq!(summary.tasks_dispatched, 0);
    assert_eq!(summary.tasks_aborted, 0);
    assert_eq!(
        cluster.request_status(request_id).await,
        HostRoleStatus::HoldingFailed
    );

    cluster.manager.skip_task(task_id).await.unwrap();
    assert_eq!(
        cluster.task(task_id).await.status,
        HostRoleStatus::SkippedFailed
    );
    assert_eq!(
        cluster.run_to_completion(request_id, 5).await,
        HostRoleStatus::Completed
    );
}

#[tokio::test]
async fn test_report_listener_applies_channel_reports() {
    let cluster = TestCluster::new(&["h1", "h2"]);
    let sent = dispatched(&cluster, &["h1", "h2"]).await;

    let (sender, receiver) = mpsc::channel(8);
    let listener = Arc::clone(&cluster.reports).spawn_report_listener(receiver);
    for task_id in &sent {
        sender
            .send(CommandReport::new(*task_id, ReportedStatus::Completed))
            .await
            .unwrap();
    }
    drop(sender);
    listener.await.unwrap();

    // Handlers run on their own spawned tasks
    for _ in 0..50 {
        let mut done = true;
        for task_id in &sent {
            done &= cluster.task(*task_id).await.status == HostRoleStatus::Completed;
        }
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("reports were not applied");
}
