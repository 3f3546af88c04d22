//! Reconciler tuning

use std::time::Duration;

use togroups_common::retry::RetryConfig;

/// Default periodic re-derivation interval
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default deadline for one reconcile run
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timings and bounds for the lifecycle reconciler
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilerConfig {
    /// How often every source is re-derived without a change event
    pub refresh_interval: Duration,
    /// Deadline for a whole reconcile run, resolution and writes included
    pub reconcile_timeout: Duration,
    /// Build-and-write attempts when the store reports a version conflict
    pub conflict_retries: u32,
    /// Backoff for store calls while the store is unavailable
    pub store_retry: RetryConfig,
    /// How often derivatives of vanished sources are swept
    pub orphan_sweep_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            conflict_retries: 5,
            store_retry: RetryConfig::with_max_attempts(5),
            orphan_sweep_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}
