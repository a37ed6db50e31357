//! Metrics registry for vigil observability
//!
//! Provides OpenTelemetry metrics for:
//! - DesiredAgent reconciliation (duration, errors)
//! - Managed workload operations by outcome
//! - Override conflicts
//! - Applied node profiles

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for vigil metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("vigil"));

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of DesiredAgent reconciliation duration
///
/// Labels:
/// - `agent`: `namespace/name`
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("vigil_reconcile_duration_seconds")
        .with_description("Duration of DesiredAgent reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `agent`: `namespace/name`
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vigil_reconcile_errors_total")
        .with_description("Total number of DesiredAgent reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Workload Metrics
// ============================================================================

/// Counter of workload operations
///
/// Labels:
/// - `kind`: DaemonSet, Deployment, ExtendedDaemonSet
/// - `outcome`: create, update, replace, noop, defer, delete
pub static WORKLOAD_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vigil_workload_operations_total")
        .with_description("Total number of managed workload operations by outcome")
        .with_unit("{operations}")
        .build()
});

/// Counter of override conflicts
///
/// Labels:
/// - `component`: component name
pub static OVERRIDE_CONFLICTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vigil_override_conflicts_total")
        .with_description("Components required by features but disabled by an override")
        .with_unit("{conflicts}")
        .build()
});

// ============================================================================
// Profile Metrics
// ============================================================================

/// Gauge of applied profiles, the default one included
///
/// Labels:
/// - `agent`: `namespace/name`
pub static APPLIED_PROFILES: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("vigil_applied_profiles")
        .with_description("Number of node profiles applied by the last reconcile")
        .with_unit("{profiles}")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

/// Outcome of one workload diff/apply pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadOutcome {
    /// Object created
    Create,
    /// Object updated in place
    Update,
    /// Object deleted with orphans because its selector changed
    Replace,
    /// Nothing to do
    Noop,
    /// Update held back by the canary gate
    Defer,
    /// Object removed
    Delete,
}

impl WorkloadOutcome {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Noop => "noop",
            Self::Defer => "defer",
            Self::Delete => "delete",
        }
    }
}

/// Record a reconciliation with timing
pub struct ReconcileTimer {
    agent: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("agent", self.agent),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("agent", self.agent.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("agent", self.agent),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}

/// Record a workload operation
pub fn record_workload_operation(kind: &str, outcome: WorkloadOutcome) {
    WORKLOAD_OPERATIONS.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("outcome", outcome.as_str()),
        ],
    );
}

/// Record an override conflict
pub fn record_override_conflict(component: &str) {
    OVERRIDE_CONFLICTS.add(1, &[KeyValue::new("component", component.to_string())]);
}

/// Update the applied-profile gauge
pub fn set_applied_profiles(agent: &str, count: i64) {
    APPLIED_PROFILES.record(count, &[KeyValue::new("agent", agent.to_string())]);
}
