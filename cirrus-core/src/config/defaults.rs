//! Default configuration values for Cirrus
//!
//! This module centralizes all default values to make them easy to find and modify.

// Storage defaults
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_DATABASE_FILE: &str = "cirrus.redb";

// Retry defaults
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 10;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

// Work queue defaults
pub const DEFAULT_PROCESSING_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_WORK_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

// Worker defaults
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_WORKER_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_SERVER_ID: &str = "cirrus-0";
