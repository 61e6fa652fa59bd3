//! # Data Models
//!
//! Plain data carried between the orchestration components: requests,
//! stages, host role commands, execution commands and agent reports.
//! Persistence lives behind `crate::repository`; nothing here talks to
//! storage.

pub mod execution_command;
pub mod report;
pub mod request;
pub mod role;
pub mod stage;
pub mod task;

pub type RequestId = i64;
pub type StageId = i64;
pub type TaskId = i64;

pub use execution_command::ExecutionCommand;
pub use report::{CommandReport, ReportedStatus};
pub use request::Request;
pub use role::{Role, RoleCommand, RoleCommandPair};
pub use stage::{Stage, StagePolicy, StageStatusSummary};
pub use task::HostRoleCommand;
