#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # ClusterOps Core
//!
//! Request/stage/task orchestration core for a cluster management server.
//!
//! ## Overview
//!
//! Operators ask for high-level operations: install a service, restart its
//! components, remove Kerberos identities. Each operation becomes a
//! *request*: an ordered list of *stages*, each a batch of *host role
//! commands* (tasks) that may run in parallel. This crate
//!
//! - splits an operation into stages following the stack's role command
//!   order ([`ordering`], [`stages`])
//! - dispatches the tasks of each stage to agents under per-host and global
//!   caps, sweeping timeouts and aborting work behind failed stages
//!   ([`orchestration::ActionScheduler`])
//! - ingests asynchronous agent reports
//!   ([`orchestration::HeartbeatProcessor`])
//! - derives stage and request status from task state
//!   ([`orchestration::StatusAggregator`])
//!
//! ## Module Organization
//!
//! - [`models`] - requests, stages, tasks, commands and reports
//! - [`state_machine`] - task statuses and the transition table
//! - [`ordering`] - role command order rules, resolution and partitioning
//! - [`stages`] - request stage containers and multi-stage builders
//! - [`repository`] - persistence port with in-memory and PostgreSQL stores
//! - [`transport`] - outbound command delivery port
//! - [`topology`] - which hosts exist and their parameters
//! - [`orchestration`] - scheduler, report ingestion, aggregation, facade
//! - [`events`] - lifecycle event stream
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use clusterops_core::config::OrchestratorConfig;
//! use clusterops_core::events::EventPublisher;
//! use clusterops_core::models::{Role, RoleCommand};
//! use clusterops_core::ordering::{RoleOrderingRules, StaticRoleOrderProvider};
//! use clusterops_core::orchestration::{ActionManager, ActionScheduler};
//! use clusterops_core::repository::InMemoryTaskRepository;
//! use clusterops_core::topology::StaticClusterTopology;
//! use clusterops_core::transport::ChannelTransport;
//!
//! # async fn example() -> clusterops_core::Result<()> {
//! let config = OrchestratorConfig::default();
//! let repository = Arc::new(InMemoryTaskRepository::new());
//! let topology = Arc::new(StaticClusterTopology::with_hosts(["c6401", "c6402"]));
//! let events = EventPublisher::new(config.events.channel_capacity);
//! let (transport, _agent_inbox) = ChannelTransport::channel(256);
//!
//! let scheduler = ActionScheduler::new(
//!     repository.clone(),
//!     Arc::new(transport),
//!     topology.clone(),
//!     events.clone(),
//!     config.scheduler.clone(),
//! );
//! let manager = ActionManager::new(
//!     repository,
//!     topology,
//!     Arc::new(StaticRoleOrderProvider::new(RoleOrderingRules::default())),
//!     events,
//!     &config,
//! )
//! .with_scheduler_wakeup(scheduler.wakeup_handle());
//!
//! let mut request = manager.create_request("c1", "Start DataNodes").await?;
//! let mut stage = manager.new_stage("c1", "Start DataNodes");
//! for host in ["c6401", "c6402"] {
//!     stage.add_task(manager.new_task(Some(host.into()), Role::new("DATANODE"), RoleCommand::Start));
//! }
//! request.add_stage(stage);
//! manager.submit(&mut request).await?;
//!
//! scheduler.tick().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod ordering;
pub mod repository;
pub mod stages;
pub mod state_machine;
pub mod topology;
pub mod transport;

pub use config::{ConfigManager, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use orchestration::{ActionManager, ActionScheduler, HeartbeatProcessor, StatusAggregator};
