//! Prometheus metrics for the cohort engine
//!
//! Collectors are registered once in the default registry; the `record_*`
//! helpers are what the engine and store clients call.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    // === Engine Counters ===

    /// Events tracked, by tracking granularity and outcome
    pub static ref EVENTS_TRACKED: CounterVec = register_counter_vec!(
        "cohort_events_tracked_total",
        "Total TrackEvent calls by granularity and whether the bit was new",
        &["granularity", "outcome"]
    ).unwrap();

    /// Bucket reads issued by queries
    pub static ref BUCKET_READS: CounterVec = register_counter_vec!(
        "cohort_bucket_reads_total",
        "Total bucket reads by command",
        &["command"]
    ).unwrap();

    // === Latency Histograms ===

    /// Query latency by operation
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "cohort_query_duration_seconds",
        "Query latency in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    /// Store command latency
    pub static ref STORE_COMMAND_DURATION: HistogramVec = register_histogram_vec!(
        "cohort_store_command_duration_seconds",
        "Store command latency in seconds",
        &["command"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.1, 1.0]
    ).unwrap();

    // === Store Counters ===

    /// Store commands by outcome
    pub static ref STORE_COMMANDS: CounterVec = register_counter_vec!(
        "cohort_store_commands_total",
        "Total store commands by command and status",
        &["command", "status"]
    ).unwrap();

    /// Store command retries
    pub static ref STORE_RETRIES: CounterVec = register_counter_vec!(
        "cohort_store_retries_total",
        "Total store command retries",
        &["command"]
    ).unwrap();

    // === Errors ===

    /// Errors by kind and operation
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "cohort_errors_total",
        "Total errors by kind and operation",
        &["kind", "operation"]
    ).unwrap();

    // === Health ===

    /// Store health (0=unhealthy, 0.5=degraded, 1=healthy)
    pub static ref STORE_HEALTH: Gauge = register_gauge!(
        "cohort_store_health",
        "Store health status (0=unhealthy, 0.5=degraded, 1=healthy)"
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];

    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a TrackEvent call
#[inline]
pub fn record_track(granularity: &str, newly_set: bool) {
    let outcome = if newly_set { "new" } else { "existing" };
    EVENTS_TRACKED
        .with_label_values(&[granularity, outcome])
        .inc();
}

/// Record `count` bucket reads of one command
#[inline]
pub fn record_bucket_reads(command: &str, count: usize) {
    BUCKET_READS
        .with_label_values(&[command])
        .inc_by(count as f64);
}

/// Record a finished query
#[inline]
pub fn record_query(operation: &str, elapsed: Duration) {
    QUERY_DURATION
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

/// Record one store command round trip
#[inline]
pub fn record_store_command(command: &str, elapsed: Duration, success: bool) {
    let status = if success { "success" } else { "error" };
    STORE_COMMANDS
        .with_label_values(&[command, status])
        .inc();
    STORE_COMMAND_DURATION
        .with_label_values(&[command])
        .observe(elapsed.as_secs_f64());
}

/// Record a store command retry
#[inline]
pub fn record_store_retry(command: &str) {
    STORE_RETRIES.with_label_values(&[command]).inc();
}

/// Record an error
#[inline]
pub fn record_error(kind: &str, operation: &str) {
    ERRORS_TOTAL.with_label_values(&[kind, operation]).inc();
}

/// Update the store health gauge
#[inline]
pub fn update_store_health(value: f64) {
    STORE_HEALTH.set(value);
}
