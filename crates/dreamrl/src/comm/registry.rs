//! Name-to-factory table for collective backends, resolved once at startup.

use super::{CommunicationGroup, DistributedConfig, LocalHub};
use crate::{DreamError, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Builds one world-group handle per rank.
pub type BackendFactory =
    Box<dyn Fn(&DistributedConfig) -> Result<Vec<Box<dyn CommunicationGroup>>> + Send + Sync>;

#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-process `"local"` backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "local",
            Box::new(|config: &DistributedConfig| {
                let hub = LocalHub::new(config.world_size, Duration::from_secs(config.timeout_secs));
                Ok(hub
                    .world_groups()
                    .into_iter()
                    .map(|g| Box::new(g) as Box<dyn CommunicationGroup>)
                    .collect())
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &str, factory: BackendFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.factories.keys()
    }

    /// World-group handles for every rank of the configured backend.
    pub fn launch(&self, config: &DistributedConfig) -> Result<Vec<Box<dyn CommunicationGroup>>> {
        let factory = self.factories.get(&config.backend).ok_or_else(|| {
            DreamError::Configuration(format!(
                "unknown distributed backend '{}', available: {}",
                config.backend,
                self.factories.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        info!(
            backend = %config.backend,
            world_size = config.world_size,
            "launching collective backend"
        );
        factory(config)
    }
}
