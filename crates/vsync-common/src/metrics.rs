//! Metrics for the sync engine
//!
//! Instruments are created lazily from the global meter, so they are no-ops
//! until [`crate::telemetry::init_telemetry`] installs an exporter.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("vsync"));

/// Reconciles by kind and outcome
///
/// Labels:
/// - `kind`: GVK string
/// - `outcome`: done, requeue, error
pub static RECONCILES_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vsync_reconciles_total")
        .with_description("Total number of reconciles by kind and outcome")
        .with_unit("{reconciles}")
        .build()
});

/// Reconcile duration in seconds
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("vsync_reconcile_duration_seconds")
        .with_description("Duration of a single reconcile in seconds")
        .with_unit("s")
        .build()
});

/// API writes issued by the engine
///
/// Labels:
/// - `side`: virtual, host
/// - `operation`: create, patch, patch_status, delete
pub static WRITES_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vsync_writes_total")
        .with_description("Total number of writes issued to either cluster")
        .with_unit("{writes}")
        .build()
});

/// Per-item failures during background sweeps
pub static SWEEP_FAILURES_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vsync_sweep_failures_total")
        .with_description("Total number of objects a sweep failed to process")
        .with_unit("{failures}")
        .build()
});

/// Which cluster a write targeted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// The tenant-facing cluster
    Virtual,
    /// The backing cluster
    Host,
}

impl Side {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Virtual => "virtual",
            Side::Host => "host",
        }
    }
}

/// Record one write
pub fn record_write(side: Side, operation: &'static str) {
    WRITES_TOTAL.add(
        1,
        &[
            KeyValue::new("side", side.as_str()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Times one reconcile; call [`ReconcileTimer::finish`] with the outcome
pub struct ReconcileTimer {
    kind: String,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile of `kind`
    pub fn start(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            start: Instant::now(),
        }
    }

    /// Record duration and outcome
    pub fn finish(self, outcome: &'static str) {
        let labels = [
            KeyValue::new("kind", self.kind),
            KeyValue::new("outcome", outcome),
        ];
        RECONCILE_DURATION.record(self.start.elapsed().as_secs_f64(), &labels);
        RECONCILES_TOTAL.add(1, &labels);
    }
}
