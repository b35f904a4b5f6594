//! Common patterns shared across the control plane

pub mod retry;

pub use retry::{retry, BackoffStrategy, JitterStrategy, RetryConfig};
