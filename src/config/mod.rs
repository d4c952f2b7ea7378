//! # DM Configuration System
//!
//! Typed configuration for the mutation engine, the graph orchestrator and the
//! distributor registry. Values are layered with the `config` crate (see
//! [`loader`]) and deserialized into [`DmConfig`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dm_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().engine.worker_count;
//! let polls = manager.config().timeouts.max_status_polls;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    pub engine: EngineConfig,
    pub timeouts: TimeoutConfig,
    pub graph: GraphConfig,
    pub acl: AclConfig,
    pub database: DatabaseConfig,
    /// Distributor configurations keyed by the name quests refer to
    pub distributors: HashMap<String, DistributorConfig>,
    /// Static quest templates keyed by template name
    pub templates: HashMap<String, TemplateConfig>,
}

/// Mutation engine worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    /// How long a claimed journal entry stays invisible to other workers
    pub lease_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// BackDeps acknowledged per RecordCompletion transaction
    pub completion_batch_size: usize,
    /// Upper bound for `run_until_idle` so a livelocked chain cannot spin forever
    pub max_idle_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 250,
            lease_ms: 30_000,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
            completion_batch_size: 64,
            max_idle_iterations: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_ms as i64)
    }

    /// Capped exponential backoff for the `attempts`-th redelivery (1-based).
    pub fn retry_delay(&self, attempts: u32) -> chrono::Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let delay = self
            .retry_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_ms);
        chrono::Duration::milliseconds(delay as i64)
    }
}

/// Timeout handling for executions that are stopping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// GetStatus polls before a STOPPING execution is declared TIMED_OUT
    pub max_status_polls: u32,
    pub status_poll_delay_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            max_status_polls: 3,
            status_poll_delay_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    /// Delay before the `poll`-th (0-based) status re-check
    pub fn status_poll_delay(&self, poll: u32) -> chrono::Duration {
        let factor = 1i64 << poll.min(16);
        chrono::Duration::milliseconds((self.status_poll_delay_ms as i64).saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Parallelism for read-only existence checks and graph walks
    pub max_concurrency: usize,
    pub max_walk_depth: usize,
    pub max_walk_nodes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            max_walk_depth: 8,
            max_walk_nodes: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    pub reader_groups: BTreeSet<String>,
    pub writer_groups: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// One named distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Registered factory kind that builds this distributor
    pub kind: String,
    #[serde(default = "default_distributor_version")]
    pub version: String,
    /// Backend specific settings handed to the factory
    #[serde(default = "empty_settings")]
    pub settings: serde_json::Value,
}

fn default_distributor_version() -> String {
    "1".to_string()
}

fn empty_settings() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A static quest template: rendered by merging caller parameters over `defaults`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub distributor_config_name: String,
    #[serde(default = "default_template_version")]
    pub version: String,
    #[serde(default = "empty_settings")]
    pub defaults: serde_json::Value,
    #[serde(default = "empty_settings")]
    pub distributor_parameters: serde_json::Value,
    /// Parameter names callers must supply
    #[serde(default)]
    pub required: Vec<String>,
}

fn default_template_version() -> String {
    "1".to_string()
}

impl DmConfig {
    /// Validate configuration values that serde cannot check on its own
    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.worker_count",
                self.engine.worker_count,
                "must be at least 1",
            ));
        }
        if self.engine.completion_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.completion_batch_size",
                self.engine.completion_batch_size,
                "must be at least 1",
            ));
        }
        if self.engine.retry_base_ms > self.engine.retry_max_ms {
            return Err(ConfigurationError::invalid_value(
                "engine.retry_base_ms",
                self.engine.retry_base_ms,
                "must not exceed engine.retry_max_ms",
            ));
        }
        if self.graph.max_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "graph.max_concurrency",
                self.graph.max_concurrency,
                "must be at least 1",
            ));
        }
        for (name, dist) in &self.distributors {
            if dist.kind.is_empty() {
                return Err(ConfigurationError::MissingRequiredField {
                    field: "kind".to_string(),
                    context: format!("distributors.{name}"),
                });
            }
        }
        for (name, template) in &self.templates {
            if !self.distributors.is_empty()
                && !self.distributors.contains_key(&template.distributor_config_name)
            {
                return Err(ConfigurationError::invalid_value(
                    format!("templates.{name}.distributor_config_name"),
                    &template.distributor_config_name,
                    "no distributor with that name is configured",
                ));
            }
        }
        Ok(())
    }
}
