//! # Role Command Ordering
//!
//! Turns a stack's role command order into stages.
//!
//! ## Overview
//!
//! - `rules`: the role-order document model and the providers that load it
//! - `resolver`: the transitively closed partial order for one operation
//! - `role_graph`: longest-path partitioning of commands into stages
//!
//! Resolution is pure and deterministic. A cyclic rule set is a
//! configuration error and is reported before any stage is built.

pub mod resolver;
pub mod role_graph;
pub mod rules;

pub use resolver::{DependencyScope, PartialOrder, RelativeOrder, RoleCommandOrderResolver};
pub use role_graph::RoleGraph;
pub use rules::{
    CachingRoleOrderProvider, RoleOrderProvider, RoleOrderingRule, RoleOrderingRules, StackId,
    StaticRoleOrderProvider,
};
