//! Resolves ordering rules into a partial order over the `(role, command)`
//! pairs of one operation.

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::rules::RoleOrderingRules;
use crate::error::{OrchestratorError, Result};
use crate::models::{RoleCommand, RoleCommandPair};

/// How far an ordering edge reaches.
///
/// Declared so that `Cluster > HostLocal`: when two paths order the same
/// pair, the cluster-wide one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyScope {
    /// Only orders commands that target the same host
    HostLocal,
    /// Orders commands across the whole cluster
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeOrder {
    Before(DependencyScope),
    After(DependencyScope),
    Unordered,
}

/// Transitively closed ordering over the pairs requested by one operation.
#[derive(Debug, Clone)]
pub struct PartialOrder {
    pairs: Vec<RoleCommandPair>,
    index: HashMap<RoleCommandPair, usize>,
    /// `closure[i][j]` is set when pair `i` must precede pair `j`
    closure: Vec<Vec<Option<DependencyScope>>>,
    topological: Vec<usize>,
}

impl PartialOrder {
    pub fn pairs(&self) -> &[RoleCommandPair] {
        &self.pairs
    }

    pub fn contains(&self, pair: &RoleCommandPair) -> bool {
        self.index.contains_key(pair)
    }

    /// Scope in which `a` must precede `b`, if it must.
    pub fn precedes(&self, a: &RoleCommandPair, b: &RoleCommandPair) -> Option<DependencyScope> {
        let (i, j) = (self.index.get(a)?, self.index.get(b)?);
        self.closure[*i][*j]
    }

    pub fn compare(&self, a: &RoleCommandPair, b: &RoleCommandPair) -> RelativeOrder {
        if let Some(scope) = self.precedes(a, b) {
            RelativeOrder::Before(scope)
        } else if let Some(scope) = self.precedes(b, a) {
            RelativeOrder::After(scope)
        } else {
            RelativeOrder::Unordered
        }
    }

    /// Pairs in an order compatible with every edge.
    pub fn topological_order(&self) -> impl Iterator<Item = &RoleCommandPair> {
        self.topological.iter().map(|i| &self.pairs[*i])
    }

    /// Every pair that must precede `pair`, with the scope of the constraint.
    pub fn predecessors(&self, pair: &RoleCommandPair) -> Vec<(&RoleCommandPair, DependencyScope)> {
        let Some(&j) = self.index.get(pair) else {
            return Vec::new();
        };
        self.closure
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row[j].map(|scope| (&self.pairs[i], scope)))
            .collect()
    }

    pub(crate) fn index_of(&self, pair: &RoleCommandPair) -> Option<usize> {
        self.index.get(pair).copied()
    }

    pub(crate) fn scope_between(&self, i: usize, j: usize) -> Option<DependencyScope> {
        self.closure[i][j]
    }

    pub(crate) fn topological_indices(&self) -> &[usize] {
        &self.topological
    }
}

/// Ordering that holds regardless of the stack's rules.
fn default_precedes(first: RoleCommand, second: RoleCommand) -> bool {
    use RoleCommand::*;
    matches!(
        (first, second),
        (Install, Start | Restart | ServiceCheck | CustomCommand)
            | (Stop, Upgrade | Uninstall)
            | (Upgrade, Start)
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RoleCommandOrderResolver;

impl RoleCommandOrderResolver {
    /// Build the partial order for `requested` under `rules`.
    ///
    /// Only rules whose two ends are both requested contribute edges, so a
    /// rule chain through an absent role never orders the requested ones.
    /// Returns `OrderingCycle` naming a pair on the cycle when the edges are
    /// not acyclic.
    pub fn resolve<I>(requested: I, rules: &RoleOrderingRules) -> Result<PartialOrder>
    where
        I: IntoIterator<Item = RoleCommandPair>,
    {
        let mut pairs = Vec::new();
        let mut index = HashMap::new();
        for pair in requested {
            if !index.contains_key(&pair) {
                index.insert(pair.clone(), pairs.len());
                pairs.push(pair);
            }
        }

        let n = pairs.len();
        let mut closure = vec![vec![None; n]; n];

        for rule in rules.rules() {
            if let (Some(&i), Some(&j)) = (index.get(&rule.blocker), index.get(&rule.blocked)) {
                closure[i][j] = closure[i][j].max(Some(rule.scope));
            }
        }
        // Explicit rules override the built-in ordering of the same two pairs.
        for i in 0..n {
            for j in 0..n {
                if i != j
                    && closure[i][j].is_none()
                    && closure[j][i].is_none()
                    && default_precedes(pairs[i].command, pairs[j].command)
                {
                    closure[i][j] = Some(DependencyScope::Cluster);
                }
            }
        }

        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        for i in 0..n {
            graph.add_node(i);
        }
        for (i, row) in closure.iter().enumerate() {
            for (j, scope) in row.iter().enumerate() {
                if scope.is_some() {
                    graph.add_edge(i, j, ());
                }
            }
        }

        let topological = match toposort(&graph, None) {
            Ok(order) => order,
            Err(cycle) => {
                let pair = pairs[cycle.node_id()].clone();
                warn!(pair = %pair, "Role command order contains a cycle");
                return Err(OrchestratorError::OrderingCycle { pair });
            }
        };

        // Widest-path closure: a path is as wide as its narrowest edge, and
        // the widest path between two pairs decides the scope.
        for k in 0..n {
            for i in 0..n {
                let Some(left) = closure[i][k] else { continue };
                for j in 0..n {
                    if let Some(right) = closure[k][j] {
                        closure[i][j] = closure[i][j].max(Some(left.min(right)));
                    }
                }
            }
        }

        debug!(pairs = n, edges = graph.edge_count(), "Resolved role command order");

        Ok(PartialOrder {
            pairs,
            index,
            closure,
            topological,
        })
    }
}
