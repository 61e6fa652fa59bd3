//! # Orchestration Engine
//!
//! The action scheduler subsystem: dispatching tasks stage by stage,
//! ingesting agent reports, sweeping timeouts and deriving stage and request
//! status from task state.
//!
//! ## Core Components
//!
//! - **ActionScheduler**: the dispatch loop (timeouts, exclusivity, caps,
//!   downstream aborts)
//! - **HeartbeatProcessor**: applies agent reports, serialized per task
//! - **ActionManager**: request submission, operator actions and status
//!   polling
//! - **StatusAggregator**: stage and request status from task snapshots
//! - **CommandBuilder**: execution commands from stage and host parameters
//!
//! The components share nothing in memory. All coordination goes through
//! versioned task writes in the [`crate::repository::TaskRepository`].

pub mod action_manager;
pub mod action_scheduler;
pub mod command_builder;
pub mod dispatch_limits;
pub mod heartbeat_processor;
pub mod status_aggregator;
pub mod task_transitions;

pub use action_manager::ActionManager;
pub use action_scheduler::{ActionScheduler, TickSummary};
pub use command_builder::CommandBuilder;
pub use dispatch_limits::{DispatchLimits, SlotDenied};
pub use heartbeat_processor::{HeartbeatProcessor, IgnoreReason, ReportOutcome};
pub use status_aggregator::{
    calculate_request_status, calculate_stage_status, most_recent_failure, progress_percent,
    RequestStatusResponse, StageStatusView, StatusAggregator, TaskStatusView,
};
pub use task_transitions::{try_transition, TransitionOutcome};
