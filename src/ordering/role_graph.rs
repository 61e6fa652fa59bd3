//! Partitions the commands of one logical stage into ordered execution
//! stages.
//!
//! Each command lands at the length of the longest chain of commands that
//! must precede it, and each level becomes one stage. Commands on the same
//! level never depend on each other, so they can run in parallel.

use std::collections::HashMap;
use tracing::debug;

use super::resolver::{DependencyScope, PartialOrder, RoleCommandOrderResolver};
use super::rules::RoleOrderingRules;
use crate::error::{OrchestratorError, Result};
use crate::models::{HostRoleCommand, RoleCommandPair, Stage};

#[derive(Debug, Clone, Copy)]
pub struct RoleGraph<'a> {
    order: &'a PartialOrder,
}

impl<'a> RoleGraph<'a> {
    pub fn new(order: &'a PartialOrder) -> Self {
        Self { order }
    }

    /// Resolve `rules` for the commands in `stage` and split it.
    pub fn partition_stage(stage: Stage, rules: &RoleOrderingRules) -> Result<Vec<Stage>> {
        let pairs = stage
            .tasks
            .iter()
            .map(|task| RoleCommandPair::new(task.role.clone(), task.command));
        let order = RoleCommandOrderResolver::resolve(pairs, rules)?;
        let template = stage.template();
        RoleGraph::new(&order).partition(&template, stage.tasks)
    }

    /// Longest-path level of every command, in input order.
    pub fn levels(&self, commands: &[HostRoleCommand]) -> Result<Vec<usize>> {
        let pair_count = self.order.pairs().len();
        let mut by_pair: Vec<Vec<usize>> = vec![Vec::new(); pair_count];
        for (position, command) in commands.iter().enumerate() {
            let pair = RoleCommandPair::new(command.role.clone(), command.command);
            let index = self.order.index_of(&pair).ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "command {pair} is not part of the resolved role command order"
                ))
            })?;
            by_pair[index].push(position);
        }

        let mut levels = vec![0usize; commands.len()];
        let mut pair_level: Vec<Option<usize>> = vec![None; pair_count];
        let mut pair_host_level: HashMap<(usize, Option<&str>), usize> = HashMap::new();

        for &current in self.order.topological_indices() {
            for &position in &by_pair[current] {
                let host = commands[position].host_name.as_deref();
                let mut level = 0;
                for predecessor in 0..pair_count {
                    let reached = match self.order.scope_between(predecessor, current) {
                        Some(DependencyScope::Cluster) => pair_level[predecessor],
                        Some(DependencyScope::HostLocal) => {
                            pair_host_level.get(&(predecessor, host)).copied()
                        }
                        None => None,
                    };
                    if let Some(reached) = reached {
                        level = level.max(reached + 1);
                    }
                }
                levels[position] = level;
            }
            for &position in &by_pair[current] {
                let level = levels[position];
                let host = commands[position].host_name.as_deref();
                let slot = pair_level[current].get_or_insert(level);
                *slot = (*slot).max(level);
                let host_slot = pair_host_level.entry((current, host)).or_insert(level);
                *host_slot = (*host_slot).max(level);
            }
        }

        Ok(levels)
    }

    /// Group `commands` into stages cloned from `template`, numbered from
    /// `template.stage_id + 1`.
    pub fn partition(
        &self,
        template: &Stage,
        commands: Vec<HostRoleCommand>,
    ) -> Result<Vec<Stage>> {
        let levels = self.levels(&commands)?;
        let depth = levels.iter().max().map_or(0, |deepest| deepest + 1);

        let mut stages: Vec<Stage> = (0..depth)
            .map(|level| {
                let mut stage = template.template();
                stage.stage_id = template.stage_id + 1 + level as i64;
                stage
            })
            .collect();

        for (mut command, level) in commands.into_iter().zip(levels) {
            let stage = &mut stages[level];
            command.stage_id = stage.stage_id;
            stage.add_task(command);
        }

        debug!(
            context = %template.context,
            stages = stages.len(),
            "Partitioned commands into stages"
        );

        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, RoleCommand};

    fn command(host: &str, role: &str) -> HostRoleCommand {
        HostRoleCommand::new(Some(host.to_string()), Role::new(role), RoleCommand::Start)
    }

    fn pair(text: &str) -> RoleCommandPair {
        text.parse().unwrap()
    }

    fn roles(stage: &Stage) -> Vec<String> {
        stage
            .tasks
            .iter()
            .map(|task| format!("{}@{}", task.role, task.host_name.as_deref().unwrap_or("-")))
            .collect()
    }

    #[test]
    fn test_same_role_on_many_hosts_shares_a_stage() {
        let mut rules = RoleOrderingRules::default();
        rules.add(pair("ZOOKEEPER_SERVER-START"), pair("HBASE_MASTER-START"));

        let mut stage = Stage::new("c1", "Start all");
        stage.stage_id = 4;
        stage.add_task(command("h1", "HBASE_MASTER"));
        stage.add_task(command("h1", "ZOOKEEPER_SERVER"));
        stage.add_task(command("h2", "ZOOKEEPER_SERVER"));

        let stages = RoleGraph::partition_stage(stage, &rules).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage_id, 5);
        assert_eq!(stages[1].stage_id, 6);
        assert_eq!(roles(&stages[0]), vec!["ZOOKEEPER_SERVER@h1", "ZOOKEEPER_SERVER@h2"]);
        assert_eq!(roles(&stages[1]), vec!["HBASE_MASTER@h1"]);
        assert!(stages.iter().all(|s| s.context == "Start all"));
    }

    #[test]
    fn test_host_local_rules_only_order_same_host() {
        let mut rules = RoleOrderingRules::default();
        rules.add_scoped(
            pair("METRICS_MONITOR-START"),
            pair("DATANODE-START"),
            DependencyScope::HostLocal,
        );

        let mut stage = Stage::new("c1", "Start");
        stage.add_task(command("h1", "METRICS_MONITOR"));
        stage.add_task(command("h1", "DATANODE"));
        stage.add_task(command("h2", "DATANODE"));

        let stages = RoleGraph::partition_stage(stage, &rules).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(roles(&stages[0]), vec!["METRICS_MONITOR@h1", "DATANODE@h2"]);
        assert_eq!(roles(&stages[1]), vec!["DATANODE@h1"]);
    }

    #[test]
    fn test_unordered_commands_stay_in_one_stage() {
        let mut stage = Stage::new("c1", "Start");
        stage.add_task(command("h1", "A"));
        stage.add_task(command("h2", "B"));
        let stages = RoleGraph::partition_stage(stage, &RoleOrderingRules::default()).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].tasks.len(), 2);
        assert_eq!(stages[0].tasks[1].stage_id, 1);
    }

    #[test]
    fn test_empty_stage_yields_nothing() {
        let stage = Stage::new("c1", "Nothing");
        let stages = RoleGraph::partition_stage(stage, &RoleOrderingRules::default()).unwrap();
        assert!(stages.is_empty());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut rules = RoleOrderingRules::default();
        rules.add(pair("A-START"), pair("B-START"));
        rules.add(pair("B-START"), pair("A-START"));

        let mut stage = Stage::new("c1", "Start");
        stage.add_task(command("h1", "A"));
        stage.add_task(command("h1", "B"));
        let err = RoleGraph::partition_stage(stage, &rules).unwrap_err();
        assert!(matches!(err, OrchestratorError::OrderingCycle { .. }));
    }
}
