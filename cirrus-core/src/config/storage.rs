//! Storage configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::defaults::*;
use crate::error::{CirrusError, CirrusResult};

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory path
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir`
    pub database_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database_file: DEFAULT_DATABASE_FILE.to_string(),
        }
    }
}

impl StorageConfig {
    /// Full path of the database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("CIRRUS_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("CIRRUS_DATABASE_FILE") {
            self.database_file = file;
        }
    }

    pub fn validate(&self) -> CirrusResult<()> {
        if self.database_file.trim().is_empty() {
            return Err(CirrusError::ConfigError(
                "storage.database_file must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
