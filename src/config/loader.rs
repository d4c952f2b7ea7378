//! Configuration Loader
//!
//! Layers the built-in defaults, the base file, the environment file and `DM__*`
//! environment variables with the `config` crate, then validates the result.
//!
//! Lookup order (later layers win):
//!
//! 1. [`DmConfig::default`]
//! 2. `DM_CONFIG_PATH`, or `<config_dir>/dm.toml` when unset (optional)
//! 3. `<config_dir>/dm.<environment>.toml` (optional)
//! 4. `DM__SECTION__KEY=value` environment variables

use super::error::{ConfigResult, ConfigurationError};
use super::DmConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ConfigManager {
    config: DmConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = crate::logging::get_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with an explicit environment.
    /// Tests use this to avoid touching process-wide environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));
        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let base_file = env::var("DM_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_directory.join("dm.toml"));
        let env_file = config_directory.join(format!("dm.{environment}.toml"));

        let config = Self::build(&base_file, &env_file)?;
        config.validate()?;

        info!(
            environment = %environment,
            distributors = config.distributors.len(),
            templates = config.templates.len(),
            workers = config.engine.worker_count,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, validating it first.
    pub fn from_config(config: DmConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: "test".to_string(),
            config_directory: PathBuf::from("config"),
        }))
    }

    fn build(base_file: &Path, env_file: &Path) -> ConfigResult<DmConfig> {
        let defaults = Config::try_from(&DmConfig::default()).map_err(|e| {
            ConfigurationError::LoadError {
                source_name: "defaults".to_string(),
                error: e.to_string(),
            }
        })?;

        let merged = Config::builder()
            .add_source(defaults)
            .add_source(File::from(base_file).required(false))
            .add_source(File::from(env_file).required(false))
            .add_source(
                Environment::with_prefix("DM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::LoadError {
                source_name: base_file.display().to_string(),
                error: e.to_string(),
            })?;

        Ok(merged.try_deserialize::<DmConfig>()?)
    }

    pub fn config(&self) -> &DmConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }
}
