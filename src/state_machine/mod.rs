//! # Task State Machine
//!
//! Status model and transition table for host role commands.
//!
//! ## Overview
//!
//! Tasks move `PENDING -> QUEUED -> IN_PROGRESS -> terminal`. Failures and
//! timeouts can be parked in the holding family when the stage asks for
//! operator intervention, or recorded as `SKIPPED_FAILED` on stages that
//! tolerate failures. A timed-out task with attempts left is queued again by
//! the scheduler.
//!
//! The machine itself holds no state. Callers load a task, apply an event to
//! a local copy and persist it through the repository's versioned
//! compare-and-set, so concurrent writers can never both win a transition.

pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::{CommandOutput, TaskEvent};
pub use states::HostRoleStatus;
pub use task_state_machine::{FailureDisposition, TaskStateMachine};
