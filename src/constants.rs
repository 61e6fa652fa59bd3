//! # System Constants
//!
//! Names, defaults and event identifiers shared across the orchestration
//! core.

/// Lifecycle events published on the orchestration event stream
pub mod events {
    // Request lifecycle
    pub const REQUEST_CREATED: &str = "request.created";
    pub const REQUEST_STATUS_CHANGED: &str = "request.status_changed";
    pub const REQUEST_COMPLETED: &str = "request.completed";
    pub const REQUEST_FAILED: &str = "request.failed";
    pub const REQUEST_ABORTED: &str = "request.aborted";

    // Stage lifecycle
    pub const STAGE_STATUS_CHANGED: &str = "stage.status_changed";

    // Task lifecycle
    pub const TASK_DISPATCHED: &str = "task.dispatched";
    pub const TASK_DISPATCH_FAILED: &str = "task.dispatch_failed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_TIMED_OUT: &str = "task.timed_out";
    pub const TASK_ABORTED: &str = "task.aborted";
    pub const TASK_HELD: &str = "task.held";
    pub const TASK_RETRY_REQUESTED: &str = "task.retry_requested";
    pub const TASK_SKIPPED: &str = "task.skipped";
}

/// Pseudo role for tasks executed inside the server
pub const SERVER_ACTION_ROLE: &str = "SERVER_ACTION";

/// Per-host concurrency key used for server-side actions
pub const SERVER_ACTION_HOST_KEY: &str = "__server__";

pub const KERBEROS_CLIENT_ROLE: &str = "KERBEROS_CLIENT";

pub const DEFAULT_SUCCESS_FACTOR: f64 = 1.0;
pub const DEFAULT_MAX_TASK_ATTEMPTS: u16 = 1;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;

/// Floor for the principal destruction step of identity deletion
pub const DESTROY_PRINCIPALS_MIN_TIMEOUT_SECS: u64 = 36_000;
pub const FINALIZE_TIMEOUT_SECS: u64 = 300;

/// Role-order document section that is always active
pub const GENERAL_DEPS_SECTION: &str = "general_deps";
/// Role-order document section whose edges only order commands on the same host
pub const HOST_LOCAL_DEPS_SECTION: &str = "host_local_deps";

pub const CANCELLED_REQUEST_REASON: &str = "Request cancelled by user";
pub const UPSTREAM_FAILURE_REASON: &str = "Aborted because an earlier stage failed";
