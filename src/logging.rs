//! # Structured Logging Module
//!
//! Environment-aware structured logging for the scheduler loop and report
//! ingestion. Console output is pretty-printed or JSON per configuration.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// `RUST_LOG` overrides the configured level; without either the level is
/// derived from the environment name.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let directive = std::env::var("RUST_LOG")
            .ok()
            .or_else(|| config.level.clone())
            .unwrap_or_else(|| get_log_level(&environment).to_string());

        let layer = match config.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(EnvFilter::new(&directive))
                .boxed(),
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(&directive))
                .boxed(),
        };

        // Another subscriber (a test harness, an embedding server) may own the
        // global slot already.
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            level = %directive,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("CLUSTEROPS_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Default log level for an environment name.
pub fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log a task lifecycle operation
pub fn log_task_operation(
    operation: &str,
    task_id: i64,
    request_id: Option<i64>,
    host_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id,
        request_id,
        host_name,
        status = %status,
        details,
        timestamp = %Utc::now().to_rfc3339(),
        "TASK_OPERATION"
    );
}

/// Log a request lifecycle operation
pub fn log_request_operation(
    operation: &str,
    request_id: i64,
    cluster_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        request_id,
        cluster_name,
        status = %status,
        details,
        timestamp = %Utc::now().to_rfc3339(),
        "REQUEST_OPERATION"
    );
}

/// Log an error with component context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
