//! Engine timing and retry configuration

use std::time::Duration;

use tracing::warn;

use crate::controller::error::BackoffConfig;

/// Timing knobs for one cluster's control loop and side loops
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Interval between reconciliation ticks when nothing else happens
    pub reconcile_interval: Duration,
    /// How long a primary may be unreachable before it is replaced
    pub failover_grace: Duration,
    /// How long to wait for a promoted member to answer as primary
    pub promotion_timeout: Duration,
    /// Poll interval used while waiting on a member
    pub poll_interval: Duration,
    /// Interval between archiver passes
    pub archive_interval: Duration,
    /// Hot standbys further behind than this are taken off the read endpoint
    pub max_read_lag_bytes: u64,
    /// Upload attempts per segment within one archiver pass
    pub archive_attempts: u32,
    pub archive_retry: BackoffConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            failover_grace: Duration::from_secs(30),
            promotion_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            archive_interval: Duration::from_secs(10),
            max_read_lag_bytes: 16 * 1024 * 1024,
            archive_attempts: 5,
            archive_retry: BackoffConfig::fast(),
        }
    }
}

impl EngineConfig {
    /// Read `GUARDIAN_*` overrides from the environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep their default
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| match lookup(key) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(v) => Duration::from_secs(v),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring invalid duration, using default");
                    default
                }
            },
            None => default,
        };
        let number = |key: &str, default: u64| match lookup(key) {
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!(key, value = %raw, "Ignoring invalid number, using default");
                default
            }),
            None => default,
        };

        Self {
            reconcile_interval: secs(
                "GUARDIAN_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
            ),
            failover_grace: secs("GUARDIAN_FAILOVER_GRACE_SECS", defaults.failover_grace),
            promotion_timeout: secs(
                "GUARDIAN_PROMOTION_TIMEOUT_SECS",
                defaults.promotion_timeout,
            ),
            poll_interval: defaults.poll_interval,
            archive_interval: secs("GUARDIAN_ARCHIVE_INTERVAL_SECS", defaults.archive_interval),
            max_read_lag_bytes: number("GUARDIAN_MAX_READ_LAG_BYTES", defaults.max_read_lag_bytes),
            archive_attempts: u32::try_from(number(
                "GUARDIAN_ARCHIVE_ATTEMPTS",
                u64::from(defaults.archive_attempts),
            ))
            .unwrap_or(defaults.archive_attempts)
            .max(1),
            archive_retry: defaults.archive_retry,
        }
    }
}
