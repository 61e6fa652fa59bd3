//! Role command order resolution and stage partitioning.

mod common;

use std::collections::HashMap;

use clusterops_core::models::{HostRoleCommand, Role, RoleCommand, RoleCommandPair, Stage};
use clusterops_core::ordering::{
    DependencyScope, RelativeOrder, RoleCommandOrderResolver, RoleGraph, RoleOrderingRules,
};
use clusterops_core::OrchestratorError;
use common::strategies::*;
use common::{hdp_stack, TestCluster, CLUSTER};
use proptest::prelude::*;

const SHIPPED_RULES: &str = include_str!("../config/role_command_order.json");

fn pair(text: &str) -> RoleCommandPair {
    text.parse().unwrap()
}

fn start(host: &str, role: &str) -> HostRoleCommand {
    HostRoleCommand::new(Some(host.into()), Role::new(role), RoleCommand::Start)
}

fn stage_roles(stages: &[Stage]) -> Vec<Vec<String>> {
    stages
        .iter()
        .map(|stage| {
            let mut roles: Vec<String> = stage
                .tasks
                .iter()
                .map(|task| task.role.as_str().to_string())
                .collect();
            roles.sort();
            roles.dedup();
            roles
        })
        .collect()
}

#[test]
fn test_three_role_chain_gives_three_stages() {
    let mut rules = RoleOrderingRules::default();
    rules
        .add(pair("A-START"), pair("B-START"))
        .add(pair("B-START"), pair("C-START"));

    let mut stage = Stage::new(CLUSTER, "Start all");
    for role in ["C", "A", "B"] {
        stage.add_task(start("h1", role));
        stage.add_task(start("h2", role));
    }

    let stages = RoleGraph::partition_stage(stage, &rules).unwrap();
    assert_eq!(
        stage_roles(&stages),
        vec![vec!["A".to_string()], vec!["B".to_string()], vec!["C".to_string()]]
    );
    assert!(stages.iter().all(|stage| stage.tasks.len() == 2));
    let ids: Vec<i64> = stages.iter().map(|stage| stage.stage_id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_unrelated_roles_share_a_stage() {
    let mut rules = RoleOrderingRules::default();
    rules.add(pair("ZOOKEEPER_SERVER-START"), pair("HBASE_MASTER-START"));

    let mut stage = Stage::new(CLUSTER, "Start");
    stage.add_task(start("h1", "DATANODE"));
    stage.add_task(start("h2", "ZOOKEEPER_SERVER"));
    stage.add_task(start("h3", "HBASE_MASTER"));

    let stages = RoleGraph::partition_stage(stage, &rules).unwrap();
    assert_eq!(
        stage_roles(&stages),
        vec![
            vec!["DATANODE".to_string(), "ZOOKEEPER_SERVER".to_string()],
            vec!["HBASE_MASTER".to_string()],
        ]
    );
}

#[test]
fn test_cycle_is_rejected() {
    let mut rules = RoleOrderingRules::default();
    rules
        .add(pair("A-START"), pair("B-START"))
        .add(pair("B-START"), pair("C-START"))
        .add(pair("C-START"), pair("A-START"));

    let err = RoleCommandOrderResolver::resolve(rules.pairs(), &rules).unwrap_err();
    assert!(matches!(err, OrchestratorError::OrderingCycle { .. }));
}

#[test]
fn test_cycle_through_absent_role_is_ignored() {
    let mut rules = RoleOrderingRules::default();
    rules
        .add(pair("A-START"), pair("B-START"))
        .add(pair("B-START"), pair("A-START"));

    let order = RoleCommandOrderResolver::resolve([pair("A-START")], &rules).unwrap();
    assert_eq!(order.pairs().len(), 1);
}

#[test]
fn test_install_precedes_start_without_rules() {
    let order = RoleCommandOrderResolver::resolve(
        [pair("DATANODE-START"), pair("DATANODE-INSTALL")],
        &RoleOrderingRules::default(),
    )
    .unwrap();
    assert_eq!(
        order.compare(&pair("DATANODE-INSTALL"), &pair("DATANODE-START")),
        RelativeOrder::Before(DependencyScope::Cluster)
    );
}

#[test]
fn test_shipped_rules_are_acyclic() {
    for sections in [vec![], vec!["namenode_optional_ha"]] {
        let rules = RoleOrderingRules::from_json_str(SHIPPED_RULES, &sections).unwrap();
        let order = RoleCommandOrderResolver::resolve(rules.pairs(), &rules).unwrap();
        assert_eq!(order.pairs().len(), rules.pairs().len());
    }
}

#[test]
fn test_host_local_dependency_only_orders_same_host() {
    let rules = RoleOrderingRules::from_json_str(SHIPPED_RULES, &[]).unwrap();
    let order = RoleCommandOrderResolver::resolve(
        [pair("NAMENODE-START"), pair("DATANODE-START")],
        &rules,
    )
    .unwrap();
    assert_eq!(
        order.precedes(&pair("NAMENODE-START"), &pair("DATANODE-START")),
        Some(DependencyScope::HostLocal)
    );

    let mut stage = Stage::new(CLUSTER, "Start HDFS");
    stage.add_task(start("c6401", "NAMENODE"));
    stage.add_task(start("c6401", "DATANODE"));
    stage.add_task(start("c6402", "DATANODE"));

    let stages = RoleGraph::partition_stage(stage, &rules).unwrap();
    assert_eq!(stages.len(), 2);
    let first: Vec<(&str, &str)> = stages[0]
        .tasks
        .iter()
        .map(|t| (t.host_name.as_deref().unwrap_or(""), t.role.as_str()))
        .collect();
    assert!(first.contains(&("c6401", "NAMENODE")));
    assert!(first.contains(&("c6402", "DATANODE")));
    assert_eq!(stages[1].tasks[0].host_name.as_deref(), Some("c6401"));
    assert_eq!(stages[1].tasks[0].role.as_str(), "DATANODE");
}

#[tokio::test]
async fn test_ordered_request_drops_departed_hosts() {
    let mut rules = RoleOrderingRules::default();
    rules.add(pair("ZOOKEEPER_SERVER-START"), pair("HBASE_MASTER-START"));
    let cluster = TestCluster::with_rules(&["h1", "h2"], rules);

    let mut container = cluster
        .manager
        .create_ordered_request(CLUSTER, "Start HBase", &hdp_stack())
        .await
        .unwrap();
    let mut stage = cluster.manager.new_stage(CLUSTER, "Start HBase");
    stage.add_task(cluster.task_for("h1", "HBASE_MASTER"));
    stage.add_task(cluster.task_for("h2", "ZOOKEEPER_SERVER"));
    stage.add_task(cluster.task_for("gone", "ZOOKEEPER_SERVER"));
    let ids = container.add_stage(stage).unwrap();

    assert_eq!(ids.len(), 2);
    assert_eq!(container.stages()[0].tasks.len(), 1);
    assert_eq!(container.stages()[0].tasks[0].host_name.as_deref(), Some("h2"));
    assert_eq!(container.stages()[1].tasks[0].role.as_str(), "HBASE_MASTER");
}

proptest! {
    #[test]
    fn acyclic_rules_always_resolve(edges in acyclic_edges_strategy()) {
        let rules = rules_from_edges(&edges);
        let order = RoleCommandOrderResolver::resolve(rules.pairs(), &rules);
        prop_assert!(order.is_ok());
    }

    #[test]
    fn topological_order_respects_every_rule(edges in acyclic_edges_strategy()) {
        let rules = rules_from_edges(&edges);
        let order = RoleCommandOrderResolver::resolve(rules.pairs(), &rules).unwrap();
        let position: HashMap<RoleCommandPair, usize> = order
            .topological_order()
            .cloned()
            .enumerate()
            .map(|(index, pair)| (pair, index))
            .collect();
        for rule in rules.rules() {
            prop_assert!(position[&rule.blocker] < position[&rule.blocked]);
        }
    }

    #[test]
    fn partition_places_blockers_in_earlier_stages(
        edges in acyclic_edges_strategy(),
        commands in commands_strategy(),
    ) {
        let rules = rules_from_edges(&edges);
        let total = commands.len();
        let mut stage = Stage::new(CLUSTER, "Start");
        for command in commands {
            stage.add_task(command);
        }

        let stages = RoleGraph::partition_stage(stage, &rules).unwrap();
        prop_assert_eq!(stages.iter().map(|s| s.tasks.len()).sum::<usize>(), total);
        prop_assert!(stages.iter().all(|s| !s.tasks.is_empty()));

        let mut stage_of_role: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, stage) in stages.iter().enumerate() {
            for task in &stage.tasks {
                prop_assert_eq!(task.stage_id, stage.stage_id);
                stage_of_role
                    .entry(task.role.as_str().to_string())
                    .or_default()
                    .push(index);
            }
        }
        for &(blocker, blocked) in &edges {
            let (Some(before), Some(after)) = (
                stage_of_role.get(&role_name(blocker)),
                stage_of_role.get(&role_name(blocked)),
            ) else {
                continue;
            };
            let latest_blocker = before.iter().max().copied().unwrap_or(0);
            let earliest_blocked = after.iter().min().copied().unwrap_or(usize::MAX);
            prop_assert!(latest_blocker < earliest_blocked);
        }
    }
}
