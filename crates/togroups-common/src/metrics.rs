//! Metrics registry for togroups observability
//!
//! Provides OpenTelemetry metrics for:
//! - Group resolution (counts by outcome, latency per provider)
//! - Derivation (outcome of each reconcile run)
//! - Derivative writes (create, replace, delete)
//! - Orphan sweeps

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for togroups metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("togroups"));

// ============================================================================
// Group Resolution Metrics
// ============================================================================

/// Counter of group resolutions
///
/// Labels:
/// - `provider`: aws
/// - `result`: success, error, timeout, cancelled
pub static GROUP_RESOLUTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("togroups_group_resolutions_total")
        .with_description("Total number of group resolutions by outcome")
        .with_unit("{resolutions}")
        .build()
});

/// Histogram of group resolution latency
///
/// Labels:
/// - `provider`: aws
pub static GROUP_RESOLUTION_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("togroups_group_resolution_duration_seconds")
        .with_description("Duration of group resolution in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Derivation Metrics
// ============================================================================

/// Counter of reconcile outcomes
///
/// Labels:
/// - `outcome`: created, updated, unchanged, deleted, nothing_to_do, failed
/// - `error_type`: error kind label on failures
pub static DERIVATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("togroups_derivations_total")
        .with_description("Total number of derivation runs by outcome")
        .with_unit("{derivations}")
        .build()
});

/// Counter of derivative writes
///
/// Labels:
/// - `operation`: create, replace, delete
pub static DERIVATIVE_WRITES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("togroups_derivative_writes_total")
        .with_description("Total number of derivative policy writes")
        .with_unit("{writes}")
        .build()
});

/// Counter of orphaned derivatives removed by the sweeper
pub static ORPHANS_REMOVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("togroups_orphans_removed_total")
        .with_description("Total number of orphaned derivatives deleted")
        .with_unit("{policies}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Outcome label for a group resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionResult {
    /// Provider returned addresses (possibly none)
    Success,
    /// Provider returned an error
    Error,
    /// Provider exceeded the resolver deadline
    Timeout,
    /// Caller cancelled the resolution
    Cancelled,
}

impl ResolutionResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Derivative write operation label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    /// Derivative created
    Create,
    /// Derivative replaced
    Replace,
    /// Derivative deleted
    Delete,
}

impl WriteOperation {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a group resolution with timing
pub struct ResolutionTimer {
    provider: &'static str,
    start: Instant,
}

impl ResolutionTimer {
    /// Start timing a resolution against `provider`
    pub fn start(provider: &'static str) -> Self {
        Self {
            provider,
            start: Instant::now(),
        }
    }

    /// Record completion with the given result
    pub fn complete(self, result: ResolutionResult) {
        let duration = self.start.elapsed().as_secs_f64();
        GROUP_RESOLUTIONS.add(
            1,
            &[
                KeyValue::new("provider", self.provider),
                KeyValue::new("result", result.as_str()),
            ],
        );
        GROUP_RESOLUTION_DURATION.record(duration, &[KeyValue::new("provider", self.provider)]);
    }
}

/// Record the outcome of one reconcile run
pub fn record_derivation(outcome: &'static str) {
    DERIVATIONS.add(1, &[KeyValue::new("outcome", outcome)]);
}

/// Record a failed reconcile run
pub fn record_derivation_failure(error_type: &'static str) {
    DERIVATIONS.add(
        1,
        &[
            KeyValue::new("outcome", "failed"),
            KeyValue::new("error_type", error_type),
        ],
    );
}

/// Record a derivative write
pub fn record_write(operation: WriteOperation) {
    DERIVATIVE_WRITES.add(1, &[KeyValue::new("operation", operation.as_str())]);
}

/// Record orphans removed by one sweep
pub fn record_orphans_removed(count: u64) {
    if count > 0 {
        ORPHANS_REMOVED.add(count, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_values_are_stable() {
        assert_eq!(ResolutionResult::Timeout.as_str(), "timeout");
        assert_eq!(ResolutionResult::Cancelled.as_str(), "cancelled");
        assert_eq!(WriteOperation::Replace.as_str(), "replace");
    }

    /// Recording against the no-op global meter must not panic
    #[test]
    fn recording_without_exporter_is_harmless() {
        ResolutionTimer::start("aws").complete(ResolutionResult::Success);
        record_derivation("created");
        record_derivation_failure("resolution");
        record_write(WriteOperation::Create);
        record_orphans_removed(0);
        record_orphans_removed(2);
    }
}
