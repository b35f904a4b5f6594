//! Retry and backoff for transient write contention
//!
//! Sequence bumps and work-queue claims may collide with concurrent writers.
//! Those collisions are expected and recoverable, so callers wrap them in
//! [`retry`] with a [`RetryConfig`] built from the operator's configuration.

use crate::config::RetrySettings;
use crate::error::{CirrusError, CirrusResult};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff strategy for retry operations
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential increase in delay (base * multiplier^(attempt - 1))
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(duration) => *duration,

            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let factor = multiplier.powf(attempt.saturating_sub(1) as f64);
                let delay_ms = (base.as_millis() as f64 * factor) as u64;
                let delay = Duration::from_millis(delay_ms);
                std::cmp::min(delay, *max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(10),
            max: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

/// Jitter strategy for retry delays
#[derive(Debug, Clone)]
pub enum JitterStrategy {
    /// No jitter applied
    None,
    /// Multiply the delay by a random factor in `min..max`
    ProportionalRange { min: f64, max: f64 },
}

impl Default for JitterStrategy {
    fn default() -> Self {
        JitterStrategy::ProportionalRange { min: 0.5, max: 1.5 }
    }
}

/// Configuration for retry operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,
    /// Backoff strategy to use
    pub backoff: BackoffStrategy,
    /// Jitter applied on top of the backoff delay
    pub jitter: JitterStrategy,
    /// Function to determine if an error is retryable
    pub is_retryable: fn(&CirrusError) -> bool,
    /// Per-operation identifier for log lines
    pub operation_name: Option<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
            is_retryable: CirrusError::is_transient,
            operation_name: None,
        }
    }
}

impl RetryConfig {
    /// Create a simple fixed delay retry config without jitter
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            backoff: BackoffStrategy::Fixed(delay),
            jitter: JitterStrategy::None,
            ..Default::default()
        }
    }

    /// Build the retry policy described by the operator's settings
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            backoff: BackoffStrategy::Exponential {
                base: settings.base_delay,
                max: settings.max_delay,
                multiplier: settings.multiplier,
            },
            jitter: if settings.jitter {
                JitterStrategy::default()
            } else {
                JitterStrategy::None
            },
            ..Default::default()
        }
    }

    /// Set operation name for log lines
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

fn apply_jitter(base_delay: Duration, strategy: &JitterStrategy) -> Duration {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    match strategy {
        JitterStrategy::None => base_delay,

        JitterStrategy::ProportionalRange { min, max } => {
            let jitter_factor = rng.gen_range(*min..*max);
            Duration::from_millis((base_delay.as_millis() as f64 * jitter_factor) as u64)
        }
    }
}

/// Retry an async operation with the given configuration
///
/// Non-retryable errors are returned immediately. When the attempts are
/// exhausted the last error is returned unchanged.
pub async fn retry<F, T>(config: RetryConfig, mut operation: F) -> CirrusResult<T>
where
    F: FnMut() -> Pin<Box<dyn Future<Output = CirrusResult<T>> + Send>>,
{
    let name = config.operation_name.as_deref().unwrap_or("operation");
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", name, attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                if !(config.is_retryable)(&error) {
                    debug!("{} failed with non-retryable error: {}", name, error);
                    return Err(error);
                }

                if attempt >= config.max_attempts {
                    warn!(
                        "{} gave up after {} attempts: {}",
                        name, config.max_attempts, error
                    );
                    return Err(error);
                }

                let delay = apply_jitter(config.backoff.delay(attempt), &config.jitter);

                warn!(
                    "Retry attempt {}/{} for {} after error: {} (waiting {:?})",
                    attempt, config.max_attempts, name, error, delay
                );

                sleep(delay).await;
            }
        }
    }
}
