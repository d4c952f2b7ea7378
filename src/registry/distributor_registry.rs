//! # Distributor Registry
//!
//! Resolves a quest's `distributor_config_name` to a live [`Distributor`].
//!
//! ## Overview
//!
//! Configurations come from [`DmConfig::distributors`](crate::config::DmConfig);
//! each names a factory `kind`. Factories are registered at startup and
//! instances are built lazily on first use, then cached per configuration name.
//! Embedders and tests can also register a ready-made instance directly.
//!
//! ## Key Features
//!
//! - **Thread-safe lookups** via `DashMap` and `parking_lot::RwLock`
//! - **Lazy construction** so unused backends never connect
//! - **Version pinning**: every resolution reports the configured version, which
//!   executions record

use crate::config::DistributorConfig;
use crate::distributor::{Distributor, DistributorError, DistributorFactory, DistributorResult};
use crate::logging::log_registry_operation;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
struct ResolvedDistributor {
    distributor: Arc<dyn Distributor>,
    version: String,
}

pub struct DistributorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn DistributorFactory>>>,
    configs: RwLock<HashMap<String, DistributorConfig>>,
    instances: DashMap<String, ResolvedDistributor>,
}

impl std::fmt::Debug for DistributorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributorRegistry")
            .field("factories", &self.factories.read().keys().collect::<Vec<_>>())
            .field("configs", &self.configs.read().keys().collect::<Vec<_>>())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl DistributorRegistry {
    pub fn new(configs: HashMap<String, DistributorConfig>) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            configs: RwLock::new(configs),
            instances: DashMap::new(),
        }
    }

    pub fn register_factory(&self, factory: Arc<dyn DistributorFactory>) {
        let kind = factory.kind().to_string();
        log_registry_operation("register_factory", None, Some(&kind), None, "success", None);
        self.factories.write().insert(kind, factory);
    }

    /// Register a ready-made distributor under a configuration name.
    pub fn register_instance(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        distributor: Arc<dyn Distributor>,
    ) {
        let name = name.into();
        let version = version.into();
        log_registry_operation(
            "register_instance",
            Some(&name),
            None,
            Some(&version),
            "success",
            None,
        );
        self.instances.insert(
            name,
            ResolvedDistributor {
                distributor,
                version,
            },
        );
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.instances.contains_key(name) || self.configs.read().contains_key(name)
    }

    pub fn config_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().keys().cloned().collect();
        for entry in self.instances.iter() {
            if !names.contains(entry.key()) {
                names.push(entry.key().clone());
            }
        }
        names.sort();
        names
    }

    /// Resolve `name` to a distributor and the version executions should record.
    ///
    /// An unknown name is a permanent error: retrying cannot make it appear.
    pub fn make_distributor(&self, name: &str) -> DistributorResult<(Arc<dyn Distributor>, String)> {
        if let Some(resolved) = self.instances.get(name) {
            return Ok((resolved.distributor.clone(), resolved.version.clone()));
        }

        let config = self.configs.read().get(name).cloned().ok_or_else(|| {
            DistributorError::Permanent(format!("no distributor configuration named {name:?}"))
        })?;
        let factory = self.factories.read().get(&config.kind).cloned().ok_or_else(|| {
            DistributorError::Permanent(format!(
                "distributor configuration {name:?} uses unregistered kind {:?}",
                config.kind
            ))
        })?;

        let distributor = factory.build(name, &config)?;
        debug!(config_name = %name, kind = %config.kind, "built distributor instance");
        log_registry_operation(
            "build",
            Some(name),
            Some(&config.kind),
            Some(&config.version),
            "success",
            None,
        );

        // a concurrent resolution may have won; keep whichever landed first
        let resolved = self
            .instances
            .entry(name.to_string())
            .or_insert(ResolvedDistributor {
                distributor,
                version: config.version.clone(),
            })
            .clone();
        Ok((resolved.distributor, resolved.version))
    }
}
