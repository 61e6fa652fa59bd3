//! # Orchestration Events
//!
//! Lifecycle events (task dispatched, stage status changed, request
//! finished, ...) published on a `tokio::sync::broadcast` channel. Event
//! names live in `crate::constants::events`. Publishing never blocks and
//! never fails for lack of subscribers.

pub mod publisher;

pub use publisher::{EventPublisher, PublishError, PublishedEvent};
