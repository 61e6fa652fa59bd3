//! Stage and request status derivation, progress reporting and the status
//! view handed to API clients.

mod common;

use clusterops_core::models::{CommandReport, HostRoleCommand, Role, RoleCommand, Stage};
use clusterops_core::orchestration::{calculate_request_status, calculate_stage_status};
use clusterops_core::state_machine::HostRoleStatus;
use common::TestCluster;
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = HostRoleStatus> {
    prop::sample::select(HostRoleStatus::ALL.to_vec())
}

#[tokio::test]
async fn test_progress_follows_the_request_lifecycle() {
    let cluster = TestCluster::new(&["h1", "h2"]);
    let request_id = cluster
        .submit_stages(&[("DATANODE", &["h1", "h2"][..]), ("NODEMANAGER", &["h1", "h2"][..])])
        .await;

    let view = cluster.manager.request_status(request_id).await.unwrap();
    assert_eq!(view.aggregate_status, HostRoleStatus::Pending);
    assert_eq!(view.progress_percent, 0.0);
    assert!(view.start_time.is_none());

    cluster.scheduler.tick().await.unwrap();
    let view = cluster.manager.request_status(request_id).await.unwrap();
    assert_eq!(view.aggregate_status, HostRoleStatus::Queued);
    assert!(view.progress_percent > 0.0 && view.progress_percent < 10.0);
    assert!(view.start_time.is_some());

    cluster.complete_in_flight().await;
    cluster.scheduler.tick().await.unwrap();
    let view = cluster.manager.request_status(request_id).await.unwrap();
    assert_eq!(view.stages[0].status, HostRoleStatus::Completed);
    assert_eq!(view.stages[1].status, HostRoleStatus::Queued);
    assert_eq!(view.aggregate_status, HostRoleStatus::Queued);
    assert!(view.progress_percent > 50.0 && view.progress_percent < 100.0);

    cluster.complete_in_flight().await;
    cluster.scheduler.tick().await.unwrap();
    let view = cluster.manager.request_status(request_id).await.unwrap();
    assert_eq!(view.aggregate_status, HostRoleStatus::Completed);
    assert_eq!(view.progress_percent, 100.0);
    assert!(view.end_time.is_some());
    assert_eq!(view.stages[1].summary.count(HostRoleStatus::Completed), 2);
}

#[tokio::test]
async fn test_status_view_serializes_for_clients() {
    let cluster = TestCluster::new(&["h1"]);
    let request_id = cluster.submit_stages(&[("DATANODE", &["h1"][..])]).await;
    cluster.scheduler.tick().await.unwrap();
    let task_id = cluster.transport.sent_task_ids()[0];
    cluster
        .reports
        .apply_report(CommandReport::failed(task_id, 3, "no space left on device"))
        .await
        .unwrap();

    let view = cluster.manager.request_status(request_id).await.unwrap();
    let json = serde_json::to_value(&view).unwrap();
    assert_eq!(json["request_id"], request_id);
    assert_eq!(json["aggregate_status"], "FAILED");
    assert_eq!(json["stages"][0]["tasks"][0]["exit_code"], 3);
    assert_eq!(
        json["stages"][0]["tasks"][0]["stderr"],
        "no space left on device"
    );
}

#[test]
fn test_skippable_stage_never_fails() {
    let mut stage = Stage::new("c1", "Service checks");
    stage.policy.skippable = true;
    for status in [HostRoleStatus::Failed, HostRoleStatus::Completed] {
        let mut task =
            HostRoleCommand::new(Some("h1".into()), Role::new("HDFS_SERVICE_CHECK"), RoleCommand::ServiceCheck);
        task.status = status;
        task.attempt_count = 1;
        task.attempt_limit = 1;
        stage.add_task(task);
    }
    assert_eq!(calculate_stage_status(&stage), HostRoleStatus::Completed);

    stage.policy.skippable = false;
    assert_eq!(calculate_stage_status(&stage), HostRoleStatus::Failed);
}

proptest! {
    #[test]
    fn request_is_completed_iff_every_stage_is(statuses in prop::collection::vec(status_strategy(), 0..8)) {
        let request = calculate_request_status(&statuses);
        let all_completed = statuses.iter().all(|s| *s == HostRoleStatus::Completed);
        prop_assert_eq!(request == HostRoleStatus::Completed, all_completed);
    }

    #[test]
    fn request_reports_first_unfinished_stage(statuses in prop::collection::vec(status_strategy(), 1..8)) {
        let request = calculate_request_status(&statuses);
        if let Some((index, first)) = statuses
            .iter()
            .enumerate()
            .find(|(_, s)| **s != HostRoleStatus::Completed)
        {
            let expected = if *first == HostRoleStatus::Pending && index > 0 {
                HostRoleStatus::InProgress
            } else {
                *first
            };
            prop_assert_eq!(request, expected);
        }
    }

    #[test]
    fn stage_of_completed_tasks_is_completed(count in 1usize..20) {
        let mut stage = Stage::new("c1", "Start");
        for _ in 0..count {
            let mut task =
                HostRoleCommand::new(Some("h1".into()), Role::new("DATANODE"), RoleCommand::Start);
            task.status = HostRoleStatus::Completed;
            stage.add_task(task);
        }
        prop_assert_eq!(calculate_stage_status(&stage), HostRoleStatus::Completed);
    }
}
