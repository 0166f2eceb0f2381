//! OpenTelemetry instruments for the reconcilers
//!
//! Exported through the OTLP metrics pipeline installed by
//! [`crate::telemetry::init_telemetry`]; without an endpoint the global meter
//! is a no-op.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("machineset-sync"));

/// Counter of MachineSet reconciliation decisions
///
/// Labels:
/// - `decision`: skip, steady, accept, defer, rewrite
pub static MACHINESET_DECISIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("machineset_sync_decisions_total")
        .with_description("MachineSet reconciliation decisions by outcome")
        .with_unit("{decisions}")
        .build()
});

/// Histogram of reconciliation pass duration
///
/// Labels:
/// - `controller`: machineset, machine
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("machineset_sync_reconcile_duration_seconds")
        .with_description("Duration of a reconciliation pass in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconciliation passes
///
/// Labels:
/// - `controller`: machineset, machine
/// - `error_type`: see [`crate::Error::kind_label`]
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("machineset_sync_reconcile_errors_total")
        .with_description("Failed reconciliation passes")
        .with_unit("{errors}")
        .build()
});

/// Counter of MachineSet re-queues caused by Machine availability changes
///
/// Labels:
/// - `direction`: up, down
pub static AVAILABILITY_TRIGGERS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("machineset_sync_availability_triggers_total")
        .with_description("MachineSet re-queues triggered by Machine availability transitions")
        .with_unit("{triggers}")
        .build()
});

/// Record one MachineSet decision
pub fn record_decision(decision: &'static str) {
    MACHINESET_DECISIONS.add(1, &[KeyValue::new("decision", decision)]);
}

/// Record a pass duration
pub fn record_duration(controller: &'static str, seconds: f64) {
    RECONCILE_DURATION.record(seconds, &[KeyValue::new("controller", controller)]);
}

/// Record a failed pass
pub fn record_error(controller: &'static str, error_type: &'static str) {
    RECONCILE_ERRORS.add(
        1,
        &[
            KeyValue::new("controller", controller),
            KeyValue::new("error_type", error_type),
        ],
    );
}

/// Record a Machine-triggered MachineSet re-queue
pub fn record_trigger(became_available: bool) {
    let direction = if became_available { "up" } else { "down" };
    AVAILABILITY_TRIGGERS.add(1, &[KeyValue::new("direction", direction)]);
}
