//! Cluster topology port: which hosts exist and their host-level
//! parameters.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;

pub trait ClusterTopology: Send + Sync {
    fn host_exists(&self, host_name: &str) -> bool;

    /// Host-level parameters merged into every command sent to the host.
    fn host_params(&self, host_name: &str) -> Value {
        let _ = host_name;
        Value::Object(Map::new())
    }
}

/// Topology held in memory, updated as hosts join and leave.
#[derive(Debug, Default)]
pub struct StaticClusterTopology {
    hosts: RwLock<HashMap<String, Value>>,
}

impl StaticClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topology = Self::new();
        for host in hosts {
            topology.add_host(host, Value::Object(Map::new()));
        }
        topology
    }

    pub fn add_host(&self, host_name: impl Into<String>, params: Value) {
        self.hosts.write().insert(host_name.into(), params);
    }

    pub fn remove_host(&self, host_name: &str) -> bool {
        self.hosts.write().remove(host_name).is_some()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.read().len()
    }
}

impl ClusterTopology for StaticClusterTopology {
    fn host_exists(&self, host_name: &str) -> bool {
        self.hosts.read().contains_key(host_name)
    }

    fn host_params(&self, host_name: &str) -> Value {
        self.hosts
            .read()
            .get(host_name)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hosts_come_and_go() {
        let topology = StaticClusterTopology::with_hosts(["h1", "h2"]);
        assert!(topology.host_exists("h1"));
        assert!(!topology.host_exists("h3"));

        topology.add_host("h3", json!({"java_home": "/usr/jdk"}));
        assert_eq!(topology.host_params("h3")["java_home"], "/usr/jdk");

        assert!(topology.remove_host("h1"));
        assert!(!topology.host_exists("h1"));
        assert_eq!(topology.host_count(), 2);
        assert_eq!(topology.host_params("h1"), json!({}));
    }
}
