//! Metrics module
//!
//! Prometheus metrics for the controllers, registered lazily in the default
//! registry and served by the host's `/metrics` endpoint.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

use crate::error::{Error, Result};

static RECONCILE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "netorch_reconcile_total",
        "Reconcile passes by controller and result",
        &["controller", "result"]
    )
    .expect("metric definition is valid")
});

static RECONCILE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "netorch_reconcile_duration_seconds",
        "Duration of reconcile passes",
        &["controller"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("metric definition is valid")
});

static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "netorch_queue_depth",
        "Keys waiting in the work queue",
        &["controller"]
    )
    .expect("metric definition is valid")
});

static ABSENCE_CACHE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "netorch_absence_cache_total",
        "Absence cache lookups by result",
        &["result"]
    )
    .expect("metric definition is valid")
});

static NAT_PORTS_USED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "netorch_nat_ports_used",
        "Ports allocated by a NAT gateway",
        &["namespace", "name"]
    )
    .expect("metric definition is valid")
});

/// Record the outcome of one reconcile pass.
pub fn record_reconcile(controller: &str, result: &str, elapsed: Duration) {
    RECONCILE_TOTAL
        .with_label_values(&[controller, result])
        .inc();
    RECONCILE_DURATION
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

pub fn set_queue_depth(controller: &str, depth: usize) {
    QUEUE_DEPTH
        .with_label_values(&[controller])
        .set(depth as i64);
}

/// Count an absence cache lookup; `hit` means the read was skipped.
pub fn record_absence_lookup(hit: bool) {
    ABSENCE_CACHE_TOTAL
        .with_label_values(&[if hit { "hit" } else { "miss" }])
        .inc();
}

pub fn set_nat_ports_used(namespace: &str, name: &str, ports: u32) {
    NAT_PORTS_USED
        .with_label_values(&[namespace, name])
        .set(i64::from(ports));
}

/// Drop the series of a deleted gateway.
pub fn clear_nat_ports_used(namespace: &str, name: &str) {
    let _ = NAT_PORTS_USED.remove_label_values(&[namespace, name]);
}

/// Encode all registered metrics in the text exposition format.
pub fn gather_text() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
