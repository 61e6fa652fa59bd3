//! Role command ordering rules and the providers that load them.
//!
//! A role-order document is a JSON object of named sections. Each section maps
//! a blocked `ROLE-COMMAND` to the list of `ROLE-COMMAND`s that must finish
//! first:
//!
//! ```json
//! {
//!   "general_deps": {
//!     "HBASE_MASTER-START": ["ZOOKEEPER_SERVER-START", "NAMENODE-START"]
//!   },
//!   "host_local_deps": {
//!     "DATANODE-START": ["KERBEROS_CLIENT-INSTALL"]
//!   }
//! }
//! ```
//!
//! `general_deps` is always applied. Other sections apply only when named as
//! active. Edges from `host_local_deps` only order commands on the same host.
//! Keys starting with `_` are comments.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::resolver::DependencyScope;
use crate::constants::{GENERAL_DEPS_SECTION, HOST_LOCAL_DEPS_SECTION};
use crate::error::{OrchestratorError, Result};
use crate::models::RoleCommandPair;

/// `blocker` must finish before `blocked` may start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleOrderingRule {
    pub blocker: RoleCommandPair,
    pub blocked: RoleCommandPair,
    pub scope: DependencyScope,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleOrderingRules {
    rules: Vec<RoleOrderingRule>,
}

impl RoleOrderingRules {
    pub fn new(rules: Vec<RoleOrderingRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[RoleOrderingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn add(&mut self, blocker: RoleCommandPair, blocked: RoleCommandPair) -> &mut Self {
        self.add_scoped(blocker, blocked, DependencyScope::Cluster)
    }

    pub fn add_scoped(
        &mut self,
        blocker: RoleCommandPair,
        blocked: RoleCommandPair,
        scope: DependencyScope,
    ) -> &mut Self {
        self.rules.push(RoleOrderingRule {
            blocker,
            blocked,
            scope,
        });
        self
    }

    /// Every pair mentioned by any rule.
    pub fn pairs(&self) -> HashSet<RoleCommandPair> {
        self.rules
            .iter()
            .flat_map(|rule| [rule.blocker.clone(), rule.blocked.clone()])
            .collect()
    }

    pub fn from_json_str(document: &str, active_sections: &[&str]) -> Result<Self> {
        let value: Value = serde_json::from_str(document)?;
        Self::from_document(&value, active_sections)
    }

    pub fn from_document(document: &Value, active_sections: &[&str]) -> Result<Self> {
        let sections = document.as_object().ok_or_else(|| {
            OrchestratorError::Configuration(
                "role command order document must be a JSON object".to_string(),
            )
        })?;

        let mut rules = Self::default();
        for (section, body) in sections {
            if section.starts_with('_') {
                continue;
            }
            let scope = if section == HOST_LOCAL_DEPS_SECTION {
                DependencyScope::HostLocal
            } else {
                DependencyScope::Cluster
            };
            let active = section == GENERAL_DEPS_SECTION
                || section == HOST_LOCAL_DEPS_SECTION
                || active_sections.contains(&section.as_str());
            if !active {
                debug!(section = %section, "Skipping inactive role command order section");
                continue;
            }
            rules.parse_section(section, body, scope)?;
        }
        Ok(rules)
    }

    fn parse_section(&mut self, section: &str, body: &Value, scope: DependencyScope) -> Result<()> {
        let entries = body.as_object().ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "role command order section '{section}' must be a JSON object"
            ))
        })?;

        for (blocked, blockers) in entries {
            if blocked.starts_with('_') {
                continue;
            }
            let blocked: RoleCommandPair = blocked.parse()?;
            let blockers = blockers.as_array().ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "blockers of {blocked} in section '{section}' must be an array"
                ))
            })?;
            for blocker in blockers {
                let blocker = blocker.as_str().ok_or_else(|| {
                    OrchestratorError::Configuration(format!(
                        "blocker of {blocked} in section '{section}' must be a string"
                    ))
                })?;
                self.add_scoped(blocker.parse()?, blocked.clone(), scope);
            }
        }
        Ok(())
    }
}

/// Stack identifier used to look up a role command order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackId {
    pub name: String,
    pub version: String,
}

impl StackId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// Source of role command ordering rules for a stack.
pub trait RoleOrderProvider: Send + Sync {
    fn role_command_order(&self, stack: &StackId) -> Result<Arc<RoleOrderingRules>>;
}

/// Same rules for every stack.
#[derive(Debug, Clone, Default)]
pub struct StaticRoleOrderProvider {
    rules: Arc<RoleOrderingRules>,
}

impl StaticRoleOrderProvider {
    pub fn new(rules: RoleOrderingRules) -> Self {
        Self {
            rules: Arc::new(rules),
        }
    }
}

impl RoleOrderProvider for StaticRoleOrderProvider {
    fn role_command_order(&self, _stack: &StackId) -> Result<Arc<RoleOrderingRules>> {
        Ok(Arc::clone(&self.rules))
    }
}

type RuleLoader = dyn Fn(&StackId) -> Result<RoleOrderingRules> + Send + Sync;

/// Loads rules once per stack and serves them from memory afterwards.
pub struct CachingRoleOrderProvider {
    loader: Box<RuleLoader>,
    cache: DashMap<StackId, Arc<RoleOrderingRules>>,
}

impl CachingRoleOrderProvider {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&StackId) -> Result<RoleOrderingRules> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            cache: DashMap::new(),
        }
    }

    pub fn invalidate(&self, stack: &StackId) {
        self.cache.remove(stack);
    }

    pub fn cached_stacks(&self) -> usize {
        self.cache.len()
    }
}

impl RoleOrderProvider for CachingRoleOrderProvider {
    fn role_command_order(&self, stack: &StackId) -> Result<Arc<RoleOrderingRules>> {
        if let Some(rules) = self.cache.get(stack) {
            return Ok(Arc::clone(rules.value()));
        }
        debug!(stack = %stack, "Loading role command order");
        let rules = Arc::new((self.loader)(stack)?);
        // A concurrent loader may have won; keep whichever landed first.
        let entry = self
            .cache
            .entry(stack.clone())
            .or_insert_with(|| Arc::clone(&rules));
        Ok(Arc::clone(entry.value()))
    }
}

impl fmt::Debug for CachingRoleOrderProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingRoleOrderProvider")
            .field("cached_stacks", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DOCUMENT: &str = r#"{
        "_comment": "dependencies",
        "general_deps": {
            "_comment": "ignored",
            "HBASE_MASTER-START": ["ZOOKEEPER_SERVER-START", "NAMENODE-START"]
        },
        "optional_ha": {
            "NAMENODE-START": ["JOURNALNODE-START"]
        },
        "host_local_deps": {
            "DATANODE-START": ["KERBEROS_CLIENT-INSTALL"]
        }
    }"#;

    #[test]
    fn test_general_and_host_local_sections_always_apply() {
        let rules = RoleOrderingRules::from_json_str(DOCUMENT, &[]).unwrap();
        assert_eq!(rules.rules().len(), 3);

        let host_local: Vec<_> = rules
            .rules()
            .iter()
            .filter(|rule| rule.scope == DependencyScope::HostLocal)
            .collect();
        assert_eq!(host_local.len(), 1);
        assert_eq!(host_local[0].blocked.to_string(), "DATANODE-START");
        assert_eq!(host_local[0].blocker.to_string(), "KERBEROS_CLIENT-INSTALL");
    }

    #[test]
    fn test_optional_section_applies_when_active() {
        let rules = RoleOrderingRules::from_json_str(DOCUMENT, &["optional_ha"]).unwrap();
        assert_eq!(rules.rules().len(), 4);
        assert!(rules
            .pairs()
            .contains(&"JOURNALNODE-START".parse().unwrap()));
    }

    #[test]
    fn test_malformed_documents_are_configuration_errors() {
        let err = RoleOrderingRules::from_json_str(r#"{"general_deps": []}"#, &[]).unwrap_err();
        assert!(err.is_configuration_error());

        let err = RoleOrderingRules::from_json_str(
            r#"{"general_deps": {"A-START": ["B-JUMP"]}}"#,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownRoleCommand(_)));
    }

    #[test]
    fn test_caching_provider_loads_once_per_stack() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let provider = CachingRoleOrderProvider::new(move |_stack| {
            counter.fetch_add(1, Ordering::SeqCst);
            RoleOrderingRules::from_json_str(DOCUMENT, &[])
        });

        let stack = StackId::new("HDP", "3.1");
        let first = provider.role_command_order(&stack).unwrap();
        let second = provider.role_command_order(&stack).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        provider.invalidate(&stack);
        provider.role_command_order(&stack).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(provider.cached_stacks(), 1);
    }
}
