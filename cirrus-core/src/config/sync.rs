//! Retry, work queue and worker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::defaults::*;
use super::{parse_duration_from_env, parse_duration_secs_from_env, parse_from_env};
use crate::error::{CirrusError, CirrusResult};

/// Bounded retry policy for operations that can hit write contention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Randomize delays so contending writers spread out
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn apply_env(&mut self) -> CirrusResult<()> {
        if let Some(attempts) = parse_from_env("CIRRUS_RETRY_MAX_ATTEMPTS")? {
            self.max_attempts = attempts;
        }
        self.base_delay = parse_duration_from_env("CIRRUS_RETRY_BASE_DELAY_MS", self.base_delay);
        self.max_delay = parse_duration_from_env("CIRRUS_RETRY_MAX_DELAY_MS", self.max_delay);
        Ok(())
    }

    pub fn validate(&self) -> CirrusResult<()> {
        if self.max_attempts == 0 {
            return Err(CirrusError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(CirrusError::ConfigError(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(CirrusError::ConfigError(
                "retry.base_delay must not exceed retry.max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Security-group work queue housekeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    /// A claim older than this is considered abandoned by a crashed worker
    #[serde(with = "humantime_serde")]
    pub processing_timeout: Duration,

    /// How long Done/Error items are kept before garbage collection
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Interval between recovery sweeps
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(DEFAULT_PROCESSING_TIMEOUT_SECS),
            retention: Duration::from_secs(DEFAULT_WORK_RETENTION_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl WorkQueueConfig {
    pub fn apply_env(&mut self) {
        self.processing_timeout =
            parse_duration_secs_from_env("CIRRUS_PROCESSING_TIMEOUT_SECS", self.processing_timeout);
        self.retention = parse_duration_secs_from_env("CIRRUS_WORK_RETENTION_SECS", self.retention);
        self.sweep_interval =
            parse_duration_secs_from_env("CIRRUS_SWEEP_INTERVAL_SECS", self.sweep_interval);
    }

    pub fn validate(&self) -> CirrusResult<()> {
        for (name, value) in [
            ("work_queue.processing_timeout", self.processing_timeout),
            ("work_queue.retention", self.retention),
            ("work_queue.sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(CirrusError::ConfigError(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Rule synchronization workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identifier stamped on every claimed work item
    pub server_id: String,

    /// Number of concurrent workers
    pub count: usize,

    /// Idle wait between empty polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_id: DEFAULT_SERVER_ID.to_string(),
            count: DEFAULT_WORKER_COUNT,
            poll_interval: Duration::from_millis(DEFAULT_WORKER_POLL_INTERVAL_MS),
        }
    }
}

impl WorkerConfig {
    pub fn apply_env(&mut self) -> CirrusResult<()> {
        if let Ok(id) = std::env::var("CIRRUS_SERVER_ID") {
            self.server_id = id;
        }
        if let Some(count) = parse_from_env("CIRRUS_WORKER_COUNT")? {
            self.count = count;
        }
        self.poll_interval = parse_duration_from_env("CIRRUS_POLL_INTERVAL_MS", self.poll_interval);
        Ok(())
    }

    pub fn validate(&self) -> CirrusResult<()> {
        if self.server_id.trim().is_empty() {
            return Err(CirrusError::ConfigError(
                "workers.server_id must not be empty".to_string(),
            ));
        }
        if self.count == 0 {
            return Err(CirrusError::ConfigError(
                "workers.count must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(CirrusError::ConfigError(
                "workers.poll_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
