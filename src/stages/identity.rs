//! Kerberos identity deletion as a sequence of stages.
//!
//! With identity management on, the request runs:
//!
//! 1. prepare: server action resolving the identities to delete
//! 2. delete keytabs: `KERBEROS_CLIENT` `REMOVE_KEYTAB` on every affected
//!    host that still exists (omitted when there is none)
//! 3. destroy principals: long-running server action against the KDC
//! 4. finalize: server action removing the working data directory
//!
//! With identity management off only the finalize stage is built.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::container::OrderedRequestStageContainer;
use crate::constants::{
    DESTROY_PRINCIPALS_MIN_TIMEOUT_SECS, FINALIZE_TIMEOUT_SECS, KERBEROS_CLIENT_ROLE,
};
use crate::error::Result;
use crate::models::{HostRoleCommand, Role, RoleCommand, Stage};
use crate::topology::ClusterTopology;

pub const PREPARE_DELETE_IDENTITY_ACTION: &str = "PrepareDeleteIdentityServerAction";
pub const DESTROY_PRINCIPALS_ACTION: &str = "DestroyPrincipalsServerAction";
pub const DELETE_DATA_DIR_ACTION: &str = "DeleteDataDirAction";
pub const REMOVE_KEYTAB_COMMAND: &str = "REMOVE_KEYTAB";

// Command parameter keys understood by the Kerberos server actions
pub const AUTHENTICATED_USER_NAME: &str = "authenticated_user_name";
pub const DEFAULT_REALM: &str = "default_realm";
pub const KDC_TYPE: &str = "kdc_type";
pub const IDENTITY_FILTER: &str = "identity_filter";
pub const COMPONENT_FILTER: &str = "component_filter";
pub const SERVICE_COMPONENT_FILTER: &str = "service_component_filter";
pub const HOST_FILTER: &str = "host_filter";
pub const DATA_DIRECTORY: &str = "data_directory";

/// A service component instance whose identities are being removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Component {
    pub host_name: String,
    pub service_name: String,
    pub component_name: String,
}

impl Component {
    pub fn new(
        host_name: impl Into<String>,
        service_name: impl Into<String>,
        component_name: impl Into<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            service_name: service_name.into(),
            component_name: component_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KdcType {
    MitKdc,
    ActiveDirectory,
    Ipa,
    None,
}

impl KdcType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MitKdc => "MIT_KDC",
            Self::ActiveDirectory => "ACTIVE_DIRECTORY",
            Self::Ipa => "IPA",
            Self::None => "NONE",
        }
    }
}

/// Parameters shared by every stage of an identity deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteIdentityParams {
    pub components: Vec<Component>,
    pub identities: BTreeSet<String>,
    pub authenticated_user: String,
    pub data_directory: PathBuf,
    pub default_realm: String,
    pub kdc_type: KdcType,
}

impl DeleteIdentityParams {
    /// Hosts touched by the deletion, sorted.
    pub fn affected_host_names(&self) -> BTreeSet<String> {
        self.components
            .iter()
            .map(|component| component.host_name.clone())
            .collect()
    }

    /// `service -> components` filter.
    pub fn service_component_filter(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut filter: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for component in &self.components {
            filter
                .entry(component.service_name.clone())
                .or_default()
                .insert(component.component_name.clone());
        }
        filter
    }

    /// Flat string map; collection values are JSON-encoded strings.
    pub fn as_map(&self) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        map.insert(
            AUTHENTICATED_USER_NAME.to_string(),
            self.authenticated_user.clone(),
        );
        map.insert(DEFAULT_REALM.to_string(), self.default_realm.clone());
        map.insert(KDC_TYPE.to_string(), self.kdc_type.as_str().to_string());
        map.insert(
            IDENTITY_FILTER.to_string(),
            serde_json::to_string(&self.identities)?,
        );
        map.insert(
            COMPONENT_FILTER.to_string(),
            serde_json::to_string(&self.components)?,
        );
        map.insert(
            SERVICE_COMPONENT_FILTER.to_string(),
            serde_json::to_string(&self.service_component_filter())?,
        );
        map.insert(
            HOST_FILTER.to_string(),
            serde_json::to_string(&self.affected_host_names())?,
        );
        map.insert(
            DATA_DIRECTORY.to_string(),
            self.data_directory.display().to_string(),
        );
        Ok(map)
    }

    pub fn as_json(&self) -> Result<Value> {
        Ok(Value::Object(
            self.as_map()?
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect::<Map<String, Value>>(),
        ))
    }
}

/// Builds the stages that delete Kerberos identities.
pub struct DeleteIdentityHandler {
    task_timeout_secs: u64,
    topology: Arc<dyn ClusterTopology>,
    host_params: Value,
}

impl DeleteIdentityHandler {
    pub fn new(task_timeout_secs: u64, topology: Arc<dyn ClusterTopology>) -> Self {
        Self {
            task_timeout_secs,
            topology,
            host_params: Value::Object(Map::new()),
        }
    }

    /// Cluster-level host parameters attached to every stage.
    pub fn with_host_params(mut self, host_params: Value) -> Self {
        self.host_params = host_params;
        self
    }

    pub fn add_delete_identity_stages(
        &self,
        cluster_name: &str,
        container: &mut OrderedRequestStageContainer,
        params: &DeleteIdentityParams,
        manage_identities: bool,
    ) -> Result<()> {
        if manage_identities {
            self.add_prepare(cluster_name, container, params)?;
            self.add_delete_keytabs(cluster_name, container, params)?;
            self.add_destroy_principals(cluster_name, container, params)?;
        }
        self.add_finalize(cluster_name, container, params)?;

        info!(
            request_id = container.id(),
            manage_identities,
            stages = container.stages().len(),
            "Built identity deletion stages"
        );
        Ok(())
    }

    fn server_action_stage(
        &self,
        cluster_name: &str,
        context: &str,
        action_class: &str,
        params: &DeleteIdentityParams,
        timeout_secs: u64,
    ) -> Result<Stage> {
        let mut stage = Stage::new(cluster_name, context);
        stage.host_params = self.host_params.clone();

        let mut task = HostRoleCommand::server_action(action_class, timeout_secs);
        task.command_detail = context.to_string();
        task.command_params = params.as_json()?;
        stage.add_task(task);
        Ok(stage)
    }

    fn add_prepare(
        &self,
        cluster_name: &str,
        container: &mut OrderedRequestStageContainer,
        params: &DeleteIdentityParams,
    ) -> Result<()> {
        let stage = self.server_action_stage(
            cluster_name,
            "Prepare delete identities",
            PREPARE_DELETE_IDENTITY_ACTION,
            params,
            self.task_timeout_secs,
        )?;
        container.add_stage(stage)?;
        Ok(())
    }

    fn add_delete_keytabs(
        &self,
        cluster_name: &str,
        container: &mut OrderedRequestStageContainer,
        params: &DeleteIdentityParams,
    ) -> Result<()> {
        let hosts: Vec<String> = params
            .affected_host_names()
            .into_iter()
            .filter(|host| self.topology.host_exists(host))
            .collect();
        if hosts.is_empty() {
            return Ok(());
        }

        let mut stage = Stage::new(cluster_name, "Delete Keytabs");
        stage.command_params = params.as_json()?;
        stage.host_params = self.host_params.clone();
        for host in hosts {
            let mut task = HostRoleCommand::new(
                Some(host),
                Role::new(KERBEROS_CLIENT_ROLE),
                RoleCommand::CustomCommand,
            );
            task.custom_command_name = Some(REMOVE_KEYTAB_COMMAND.to_string());
            task.command_detail = format!("{KERBEROS_CLIENT_ROLE} {REMOVE_KEYTAB_COMMAND}");
            task.timeout_secs = self.task_timeout_secs;
            stage.add_task(task);
        }
        container.add_stage(stage)?;
        Ok(())
    }

    fn add_destroy_principals(
        &self,
        cluster_name: &str,
        container: &mut OrderedRequestStageContainer,
        params: &DeleteIdentityParams,
    ) -> Result<()> {
        let stage = self.server_action_stage(
            cluster_name,
            "Destroy Principals",
            DESTROY_PRINCIPALS_ACTION,
            params,
            DESTROY_PRINCIPALS_MIN_TIMEOUT_SECS.max(self.task_timeout_secs),
        )?;
        container.add_stage(stage)?;
        Ok(())
    }

    fn add_finalize(
        &self,
        cluster_name: &str,
        container: &mut OrderedRequestStageContainer,
        params: &DeleteIdentityParams,
    ) -> Result<()> {
        let stage = self.server_action_stage(
            cluster_name,
            "Finalize Operations",
            DELETE_DATA_DIR_ACTION,
            params,
            FINALIZE_TIMEOUT_SECS,
        )?;
        container.add_stage(stage)?;
        Ok(())
    }
}
