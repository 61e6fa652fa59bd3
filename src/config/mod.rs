//! # Orchestrator Configuration
//!
//! Typed configuration for the action scheduler, stage defaults, the task
//! repository, logging and the event bus.
//!
//! ## Sources
//!
//! Values are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults (the `Default` impls below)
//! 2. `config/orchestrator.toml`
//! 3. `config/orchestrator.{environment}.toml`
//! 4. environment variables `CLUSTEROPS__{SECTION}__{KEY}`
//!
//! The environment name comes from `CLUSTEROPS_ENV`, then `APP_ENV`, and
//! defaults to `development`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use clusterops_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let tick = manager.config().scheduler.tick_interval();
//! let per_host = manager.config().scheduler.max_concurrent_tasks_per_host;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::{DEFAULT_MAX_TASK_ATTEMPTS, DEFAULT_SUCCESS_FACTOR, DEFAULT_TASK_TIMEOUT_SECS};
use crate::models::StagePolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub stage_defaults: StageDefaultsConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub events: EventsConfig,
    pub ordering: OrderingConfig,
}

/// Action scheduler loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the scheduling loop; reports may wake it earlier
    pub tick_interval_ms: u64,
    /// Cap on QUEUED/IN_PROGRESS tasks per host (the server counts as one host)
    pub max_concurrent_tasks_per_host: usize,
    /// Cap on QUEUED/IN_PROGRESS tasks across the cluster manager
    pub max_concurrent_tasks: usize,
    /// Reload-and-retry budget when a task write loses a version race
    pub conflict_retries: u32,
    /// Capacity of the inbound agent report channel
    pub report_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_concurrent_tasks_per_host: 10,
            max_concurrent_tasks: 500,
            conflict_retries: 5,
            report_channel_capacity: 1_024,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Policy given to stages that do not set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageDefaultsConfig {
    pub task_timeout_secs: u64,
    pub max_task_attempts: u16,
    pub success_factor: f64,
    pub hold_on_failure: bool,
}

impl Default for StageDefaultsConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            max_task_attempts: DEFAULT_MAX_TASK_ATTEMPTS,
            success_factor: DEFAULT_SUCCESS_FACTOR,
            hold_on_failure: false,
        }
    }
}

impl StageDefaultsConfig {
    pub fn policy(&self) -> StagePolicy {
        StagePolicy {
            success_factor: self.success_factor,
            hold_on_failure: self.hold_on_failure,
            max_task_attempts: self.max_task_attempts,
            ..StagePolicy::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/clusterops_development".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_000,
        }
    }
}

/// Where role command order rules come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// JSON rules document; relative paths resolve against the config directory
    pub rules_file: Option<PathBuf>,
    /// Optional sections applied on top of the general dependencies
    pub active_sections: Vec<String>,
}

impl OrchestratorConfig {
    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let scheduler = &self.scheduler;
        if scheduler.tick_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.tick_interval_ms",
                scheduler.tick_interval_ms,
                "must be greater than zero",
            ));
        }
        if scheduler.max_concurrent_tasks_per_host == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.max_concurrent_tasks_per_host",
                scheduler.max_concurrent_tasks_per_host,
                "must be at least 1",
            ));
        }
        if scheduler.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.max_concurrent_tasks",
                scheduler.max_concurrent_tasks,
                "must be at least 1",
            ));
        }
        if scheduler.report_channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.report_channel_capacity",
                scheduler.report_channel_capacity,
                "must be at least 1",
            ));
        }

        let defaults = &self.stage_defaults;
        if defaults.task_timeout_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "stage_defaults.task_timeout_secs",
                defaults.task_timeout_secs,
                "must be greater than zero",
            ));
        }
        if defaults.max_task_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "stage_defaults.max_task_attempts",
                defaults.max_task_attempts,
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&defaults.success_factor) {
            return Err(ConfigurationError::invalid_value(
                "stage_defaults.success_factor",
                defaults.success_factor,
                "must be within [0, 1]",
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "url", "database",
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                self.database.max_connections,
                "must be at least 1",
            ));
        }

        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                self.events.channel_capacity,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.stage_defaults.policy().max_task_attempts, 1);
    }

    #[test]
    fn test_zero_host_cap_rejected() {
        let mut config = OrchestratorConfig::default();
        config.scheduler.max_concurrent_tasks_per_host = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_tasks_per_host"));
    }

    #[test]
    fn test_success_factor_out_of_range_rejected() {
        let mut config = OrchestratorConfig::default();
        config.stage_defaults.success_factor = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }
}
