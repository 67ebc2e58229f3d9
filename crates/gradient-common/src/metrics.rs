//! Metrics recorder for the gradient controller
//!
//! Publishes OpenTelemetry instruments for:
//! - Canaries registered per namespace
//! - Primary/canary traffic weights per canary
//! - Canary lifecycle status per canary
//! - Tick duration per canary

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

use crate::crd::CanaryPhase;

/// Global meter for gradient metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("gradient"));

/// Gauge tracking registered canaries per namespace
static CANARIES_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("gradient_canaries_total")
        .with_description("Number of canaries registered per namespace")
        .with_unit("{canaries}")
        .build()
});

/// Gauge tracking the traffic weight applied to each workload
///
/// Labels: `name`, `namespace`, `workload` (primary|canary)
static CANARY_WEIGHT: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("gradient_canary_weight")
        .with_description("Traffic weight routed to the primary and canary workloads")
        .with_unit("%")
        .build()
});

/// Gauge tracking the canary lifecycle status
///
/// Value: 0 initialized, 1 progressing, 2 succeeded, 3 failed
static CANARY_STATUS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("gradient_canary_status")
        .with_description("Canary lifecycle status (0 initialized, 1 progressing, 2 succeeded, 3 failed)")
        .build()
});

/// Histogram of advancement tick duration
static CANARY_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("gradient_canary_duration_seconds")
        .with_description("Duration of a single canary advancement tick in seconds")
        .with_unit("s")
        .build()
});

/// Publish the number of canaries registered in a namespace
pub fn set_total(namespace: &str, count: i64) {
    CANARIES_TOTAL.record(
        count,
        &[KeyValue::new("namespace", namespace.to_string())],
    );
}

/// Publish the current primary/canary traffic split
pub fn set_weight(name: &str, namespace: &str, primary_weight: i32, canary_weight: i32) {
    for (workload, weight) in [("primary", primary_weight), ("canary", canary_weight)] {
        CANARY_WEIGHT.record(
            weight as i64,
            &[
                KeyValue::new("name", name.to_string()),
                KeyValue::new("namespace", namespace.to_string()),
                KeyValue::new("workload", workload),
            ],
        );
    }
}

/// Publish the canary lifecycle status
///
/// An unset phase is reported as initialized.
pub fn set_status(name: &str, namespace: &str, phase: Option<CanaryPhase>) {
    let code = phase.map(|p| p.status_code()).unwrap_or(0);
    CANARY_STATUS.record(
        code,
        &[
            KeyValue::new("name", name.to_string()),
            KeyValue::new("namespace", namespace.to_string()),
        ],
    );
}

/// Measures one advancement tick and records its duration when dropped.
///
/// The engine has many exit points; a drop guard records the duration on
/// every one of them without threading the timer through each branch.
pub struct TickTimer {
    name: String,
    namespace: String,
    start: std::time::Instant,
}

impl TickTimer {
    /// Start timing a tick for the given canary
    pub fn start(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for TickTimer {
    fn drop(&mut self) {
        CANARY_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("name", std::mem::take(&mut self.name)),
                KeyValue::new("namespace", std::mem::take(&mut self.namespace)),
            ],
        );
    }
}
