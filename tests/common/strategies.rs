//! Proptest strategies for role command order rules and commands.

use proptest::prelude::*;

use clusterops_core::models::{HostRoleCommand, Role, RoleCommand, RoleCommandPair};
use clusterops_core::ordering::RoleOrderingRules;

pub const MAX_ROLES: usize = 8;
pub const HOSTS: [&str; 3] = ["c6401", "c6402", "c6403"];

pub fn role_name(index: usize) -> String {
    format!("ROLE_{index}")
}

pub fn start_pair(index: usize) -> RoleCommandPair {
    RoleCommandPair::new(Role::new(role_name(index)), RoleCommand::Start)
}

/// Edges `(blocker, blocked)` that only point from a lower role index to a
/// higher one, so the rule set is acyclic by construction.
pub fn acyclic_edges_strategy() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..MAX_ROLES, 0..MAX_ROLES), 0..24).prop_map(|edges| {
        edges
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.min(b), a.max(b)))
            .collect()
    })
}

pub fn rules_from_edges(edges: &[(usize, usize)]) -> RoleOrderingRules {
    let mut rules = RoleOrderingRules::default();
    for &(blocker, blocked) in edges {
        rules.add(start_pair(blocker), start_pair(blocked));
    }
    rules
}

/// START commands for a random subset of roles spread over the test hosts.
pub fn commands_strategy() -> impl Strategy<Value = Vec<HostRoleCommand>> {
    prop::collection::vec((0..MAX_ROLES, 0..HOSTS.len()), 1..20).prop_map(|picks| {
        picks
            .into_iter()
            .map(|(role, host)| {
                HostRoleCommand::new(
                    Some(HOSTS[host].to_string()),
                    Role::new(role_name(role)),
                    RoleCommand::Start,
                )
            })
            .collect()
    })
}
