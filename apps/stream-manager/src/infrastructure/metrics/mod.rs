//! Prometheus Metrics Module
//!
//! Two layers of instrumentation:
//!
//! - **`MetricsCollector`**: per-backend counters and gauges behind the
//!   `GetMetrics` contract (connections, creations, cleanups, retries).
//!   Snapshots are rendered as JSON or Prometheus text on demand.
//! - **Process-wide facade**: data-path events (messages, protocol and
//!   handler errors, drops, circuit trips) recorded through the `metrics`
//!   crate and exported by the installed Prometheus recorder.

mod collector;

use std::sync::OnceLock;

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub use collector::{MetricsCollector, MetricsSnapshot};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder.
///
/// Returns `None` if another recorder was installed first.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle.clone());
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            register_metrics();
            Some(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    }
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_counter!(
        "stream_manager_messages_received_total",
        "Total messages received from upstream streams"
    );
    describe_counter!(
        "stream_manager_protocol_errors_total",
        "Total upstream frames dropped as undecodable"
    );
    describe_counter!(
        "stream_manager_handler_errors_total",
        "Total subscriber handlers detached after failing"
    );
    describe_counter!(
        "stream_manager_messages_dropped_total",
        "Total messages dropped due to slow channel subscribers"
    );
    describe_counter!(
        "stream_manager_circuit_opens_total",
        "Total times a stream exhausted its retries and opened its circuit"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record messages received from upstream.
pub fn record_messages_received(count: u64) {
    counter!("stream_manager_messages_received_total").increment(count);
}

/// Record an undecodable upstream frame.
pub fn record_protocol_error() {
    counter!("stream_manager_protocol_errors_total").increment(1);
}

/// Record a handler detached after an error or panic.
pub fn record_handler_error() {
    counter!("stream_manager_handler_errors_total").increment(1);
}

/// Record messages dropped because a channel subscriber fell behind.
pub fn record_messages_dropped(count: u64) {
    counter!("stream_manager_messages_dropped_total").increment(count);
}

/// Record a circuit-open transition.
pub fn record_circuit_open() {
    counter!("stream_manager_circuit_opens_total").increment(1);
}
