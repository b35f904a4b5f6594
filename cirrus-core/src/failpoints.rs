//! Failpoint integration for fault injection testing
//!
//! With the `failpoints` feature enabled, named points inside the contended
//! write paths can be switched on from tests to return errors. Without the
//! feature the macros expand to nothing.

/// Failpoint names used in the crate
pub mod names {
    /// Before each sequence-bump batch upsert
    pub const RULESET_BUMP: &str = "ruleset_log::bump";
    /// Inside the work-queue claim transaction
    pub const WORK_TAKE: &str = "work_queue::take";
    /// Inside the network compare-and-swap transaction
    pub const NETWORK_TRANSITION: &str = "network::transition";
}

/// Initialize failpoints for testing
/// Must be called at the start of tests that use failpoints
#[cfg(feature = "failpoints")]
pub fn init() {
    fail::cfg("cirrus", "off").ok();
}

/// Return an error from the enclosing function when the named failpoint fires
///
/// Usage:
/// ```ignore
/// fail_point!("work_queue::take", CirrusError::StorageContention {
///     operation: "take".to_string(),
/// });
/// ```
#[macro_export]
#[cfg(feature = "failpoints")]
macro_rules! fail_point {
    ($name:expr) => {{
        fail::fail_point!($name, |_| {
            Err($crate::error::CirrusError::Internal {
                message: format!("Failpoint triggered: {}", $name),
            })
        });
    }};
    ($name:expr, $err:expr) => {{
        fail::fail_point!($name, |_| { Err($err) });
    }};
}

/// No-op version for when the failpoints feature is disabled
#[macro_export]
#[cfg(not(feature = "failpoints"))]
macro_rules! fail_point {
    ($name:expr) => {};
    ($name:expr, $err:expr) => {};
}

/// Common failpoint scenarios for testing
#[cfg(feature = "failpoints")]
pub mod scenarios {
    /// Fire on the first `n` evaluations, then switch off
    pub fn fail_first_n(name: &str, n: usize) {
        let cfg = format!("{}*return->off", n);
        fail::cfg(name, &cfg).ok();
    }

    /// Fire on every evaluation
    pub fn fail_always(name: &str) {
        fail::cfg(name, "return").ok();
    }

    pub fn disable(name: &str) {
        fail::cfg(name, "off").ok();
    }
}

/// Run `f` with a failpoint configured, switching it off afterwards
#[cfg(feature = "failpoints")]
pub async fn with_failpoint<F, R>(name: &str, config: &str, f: F) -> R
where
    F: std::future::Future<Output = R>,
{
    fail::cfg(name, config)
        .map_err(|e| {
            tracing::error!("Failed to configure failpoint '{}': {}", name, e);
        })
        .ok();
    let result = f.await;
    fail::cfg(name, "off")
        .map_err(|e| {
            tracing::error!("Failed to disable failpoint '{}': {}", name, e);
        })
        .ok();
    result
}

#[cfg(test)]
#[cfg(feature = "failpoints")]
mod tests {
    use super::*;
    use crate::error::{CirrusError, CirrusResult};
    use serial_test::serial;

    fn may_fail() -> CirrusResult<()> {
        crate::fail_point!("test::plain");
        Ok(())
    }

    fn may_contend() -> CirrusResult<()> {
        crate::fail_point!(
            "test::contend",
            CirrusError::StorageContention {
                operation: "test".to_string(),
            }
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn test_failpoint_macro() {
        init();
        assert!(may_fail().is_ok());

        scenarios::fail_always("test::plain");
        assert!(matches!(may_fail(), Err(CirrusError::Internal { .. })));

        scenarios::disable("test::plain");
        assert!(may_fail().is_ok());
    }

    #[test]
    #[serial]
    fn test_fail_first_n() {
        init();
        scenarios::fail_first_n("test::contend", 2);

        assert!(may_contend().unwrap_err().is_transient());
        assert!(may_contend().unwrap_err().is_transient());
        assert!(may_contend().is_ok());
    }
}
