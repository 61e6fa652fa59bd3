//! Configuration Loader
//!
//! Environment-aware loading on top of the `config` crate: a base TOML
//! file, an optional per-environment overlay, then `CLUSTEROPS__` prefixed
//! environment variables.

use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestratorConfig;
use crate::ordering::RoleOrderingRules;

const BASE_FILE_STEM: &str = "orchestrator";
const ENV_PREFIX: &str = "CLUSTEROPS";

#[derive(Debug)]
pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load from `config_dir` for an explicit environment, without reading
    /// the environment name from process variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);
        if !config_directory.is_dir() {
            return Err(ConfigurationError::DirectoryNotFound {
                path: config_directory,
            });
        }

        debug!(
            environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment,
            tick_interval_ms = config.scheduler.tick_interval_ms,
            max_concurrent_tasks_per_host = config.scheduler.max_concurrent_tasks_per_host,
            max_concurrent_tasks = config.scheduler.max_concurrent_tasks,
            "Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already built configuration, validating it first.
    pub fn from_config(config: OrchestratorConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    pub fn resolve_config_path<P: AsRef<Path>>(&self, relative_path: P) -> PathBuf {
        let path = relative_path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_directory.join(path)
        }
    }

    /// Role command order rules named by `ordering.rules_file`, or an empty
    /// rule set when none is configured.
    pub fn load_role_order_rules(&self) -> ConfigResult<RoleOrderingRules> {
        let Some(rules_file) = &self.config.ordering.rules_file else {
            return Ok(RoleOrderingRules::default());
        };
        let path = self.resolve_config_path(rules_file);
        let document =
            std::fs::read_to_string(&path).map_err(|err| ConfigurationError::RoleOrderFile {
                file_path: path.display().to_string(),
                error: err.to_string(),
            })?;
        let sections: Vec<&str> = self
            .config
            .ordering
            .active_sections
            .iter()
            .map(String::as_str)
            .collect();
        RoleOrderingRules::from_json_str(&document, &sections).map_err(|err| {
            ConfigurationError::RoleOrderFile {
                file_path: path.display().to_string(),
                error: err.to_string(),
            }
        })
    }

    /// Sanitized view for diagnostics; the database URL password is masked.
    pub fn debug_config(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.config).unwrap_or_default();
        if let Some(url) = value
            .get_mut("database")
            .and_then(|database| database.get_mut("url"))
        {
            if let Some(text) = url.as_str() {
                *url = serde_json::Value::String(mask_password(text));
            }
        }
        value
    }

    fn detect_environment() -> String {
        env::var("CLUSTEROPS_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("CLUSTEROPS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<OrchestratorConfig> {
        let base = config_directory.join(format!("{BASE_FILE_STEM}.toml"));
        let overlay = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        let merged = Config::builder()
            .add_source(
                File::from(base.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                File::from(overlay.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|err| ConfigurationError::load_error(base.display().to_string(), err))?;

        Ok(merged.try_deserialize::<OrchestratorConfig>()?)
    }
}

fn mask_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    #[test]
    fn test_environment_overlay_wins() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "orchestrator.toml",
            r#"
[scheduler]
tick_interval_ms = 250
max_concurrent_tasks_per_host = 4

[stage_defaults]
max_task_attempts = 2
"#,
        );
        write(
            &dir,
            "orchestrator.test.toml",
            r#"
[scheduler]
max_concurrent_tasks_per_host = 1
"#,
        );

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        let config = manager.config();
        assert_eq!(config.scheduler.tick_interval_ms, 250);
        assert_eq!(config.scheduler.max_concurrent_tasks_per_host, 1);
        assert_eq!(config.stage_defaults.max_task_attempts, 2);
        assert_eq!(config.events.channel_capacity, 1_000);
        assert_eq!(manager.environment(), "test");
    }

    #[test]
    fn test_missing_directory() {
        let err = ConfigManager::load_from_directory_with_env(
            Some(PathBuf::from("/definitely/not/here")),
            "test",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::DirectoryNotFound { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "orchestrator.toml",
            "[scheduler]\nmax_concurrent_tasks = 0\n",
        );
        let err =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "qa")
                .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_role_order_rules_file() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "orchestrator.toml",
            "[ordering]\nrules_file = \"role_command_order.json\"\n",
        );
        write(
            &dir,
            "role_command_order.json",
            r#"{"general_deps": {"HBASE_MASTER-START": ["ZOOKEEPER_SERVER-START"]}}"#,
        );
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        let rules = manager.load_role_order_rules().unwrap();
        assert_eq!(rules.rules().len(), 1);
    }

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("postgresql://ops:secret@db:5432/clusterops"),
            "postgresql://ops:***@db:5432/clusterops"
        );
        assert_eq!(mask_password("postgresql://db/x"), "postgresql://db/x");
    }
}
