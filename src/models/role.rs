use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::SERVER_ACTION_ROLE;
use crate::error::OrchestratorError;

/// A service component role such as `NAMENODE` or `KERBEROS_CLIENT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Pseudo role carried by tasks that execute inside the server.
    pub fn server_action() -> Self {
        Self::new(SERVER_ACTION_ROLE)
    }

    pub fn is_server_action(&self) -> bool {
        self.0 == SERVER_ACTION_ROLE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Command kinds a role can be asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleCommand {
    Install,
    Uninstall,
    Start,
    Stop,
    Restart,
    Upgrade,
    Execute,
    ServiceCheck,
    CustomCommand,
    #[serde(rename = "ACTIONEXECUTE")]
    ActionExecute,
}

impl RoleCommand {
    pub const ALL: [RoleCommand; 10] = [
        Self::Install,
        Self::Uninstall,
        Self::Start,
        Self::Stop,
        Self::Restart,
        Self::Upgrade,
        Self::Execute,
        Self::ServiceCheck,
        Self::CustomCommand,
        Self::ActionExecute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "INSTALL",
            Self::Uninstall => "UNINSTALL",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Restart => "RESTART",
            Self::Upgrade => "UPGRADE",
            Self::Execute => "EXECUTE",
            Self::ServiceCheck => "SERVICE_CHECK",
            Self::CustomCommand => "CUSTOM_COMMAND",
            Self::ActionExecute => "ACTIONEXECUTE",
        }
    }
}

impl fmt::Display for RoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleCommand {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|command| command.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| OrchestratorError::UnknownRoleCommand(s.to_string()))
    }
}

/// `(role, command)` key used by ordering rules, rendered as `ROLE-COMMAND`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleCommandPair {
    pub role: Role,
    pub command: RoleCommand,
}

impl RoleCommandPair {
    pub fn new(role: Role, command: RoleCommand) -> Self {
        Self { role, command }
    }
}

impl fmt::Display for RoleCommandPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.role, self.command)
    }
}

impl FromStr for RoleCommandPair {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, command) = s
            .trim()
            .rsplit_once('-')
            .ok_or_else(|| OrchestratorError::UnknownRoleCommand(s.to_string()))?;
        if role.is_empty() {
            return Err(OrchestratorError::UnknownRoleCommand(s.to_string()));
        }
        Ok(Self::new(Role::new(role), command.parse()?))
    }
}
