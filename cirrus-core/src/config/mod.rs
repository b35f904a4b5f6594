//! Configuration for the Cirrus control plane
//!
//! Values come from three layers, later layers winning: built-in defaults,
//! an optional TOML file, and `CIRRUS_*` environment variables. The merged
//! result is validated before any component sees it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::capability::{ProviderDefinition, ServiceDefinition};
use crate::error::{CirrusError, CirrusResult};

pub mod defaults;
pub mod storage;
pub mod sync;

pub use defaults::*;
pub use storage::StorageConfig;
pub use sync::{RetrySettings, WorkQueueConfig, WorkerConfig};

/// Root configuration structure for Cirrus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CirrusConfig {
    /// Database location
    pub storage: StorageConfig,

    /// Retry policy for contended writes
    pub retry: RetrySettings,

    /// Work queue recovery and garbage collection
    pub work_queue: WorkQueueConfig,

    /// Rule synchronization workers
    pub workers: WorkerConfig,

    /// Extra catalog entries appended to the standard catalog
    pub catalog: CatalogConfig,
}

/// Additional services and providers registered at start-up
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub services: Vec<ServiceDefinition>,
    pub providers: Vec<ProviderDefinition>,
}

impl CirrusConfig {
    /// Parse a TOML document; missing sections fall back to defaults
    pub fn from_toml_str(contents: &str) -> CirrusResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: &Path) -> CirrusResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CirrusError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults, then the file (if any), then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> CirrusResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CIRRUS_*` environment overrides
    pub fn apply_env(&mut self) -> CirrusResult<()> {
        self.storage.apply_env();
        self.retry.apply_env()?;
        self.work_queue.apply_env();
        self.workers.apply_env()?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> CirrusResult<()> {
        self.storage.validate()?;
        self.retry.validate()?;
        self.work_queue.validate()?;
        self.workers.validate()?;
        Ok(())
    }
}

/// Helper functions for environment parsing
pub(crate) fn parse_duration_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub(crate) fn parse_from_env<T: FromStr>(key: &str) -> CirrusResult<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| CirrusError::ConfigError(format!("Invalid {}", key))),
        Err(_) => Ok(None),
    }
}
