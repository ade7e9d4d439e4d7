//! Shared state for a serving layer.

use std::sync::Arc;

use loom_core::Result;

use crate::config::ViewerConfig;
use crate::registry::DatasetRegistry;

/// Configuration and dataset registry, built once and cloned into every
/// request handler.
#[derive(Clone)]
pub struct ServerContext {
    config: Arc<ViewerConfig>,
    registry: Arc<DatasetRegistry>,
}

impl ServerContext {
    pub fn new(config: ViewerConfig) -> Result<Self> {
        let registry = DatasetRegistry::open(config.clone())?;
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
        })
    }

    /// Context configured from `LOOM_PATH` and `LOOM_LOCK_TIMEOUT`.
    pub fn from_env() -> Result<Self> {
        Self::new(ViewerConfig::from_env())
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }
}
