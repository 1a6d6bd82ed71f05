//! Per-backend counters behind `GetMetrics`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Counters and gauges for one backend instance.
///
/// Recording never blocks the data path: everything is atomics except the
/// last-retry timestamp.
#[derive(Debug)]
pub struct MetricsCollector {
    started_at: Instant,
    active_connections: AtomicU64,
    active_connections_hwm: AtomicU64,
    total_stream_creations: AtomicU64,
    total_stream_cleanups: AtomicU64,
    retry_count: AtomicU64,
    last_retry_time: RwLock<Option<DateTime<Utc>>>,
    messages_received: AtomicU64,
    protocol_errors: AtomicU64,
    handler_errors: AtomicU64,
    circuit_opens: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a collector; uptime is measured from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            active_connections: AtomicU64::new(0),
            active_connections_hwm: AtomicU64::new(0),
            total_stream_creations: AtomicU64::new(0),
            total_stream_cleanups: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            last_retry_time: RwLock::new(None),
            messages_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            circuit_opens: AtomicU64::new(0),
        }
    }

    /// A connection was created.
    pub fn record_connection_opened(&self) {
        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.active_connections_hwm
            .fetch_max(active, Ordering::SeqCst);
        self.total_stream_creations.fetch_add(1, Ordering::SeqCst);
    }

    /// A connection was torn down.
    pub fn record_connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
        self.total_stream_cleanups.fetch_add(1, Ordering::SeqCst);
    }

    /// A connection entered `RECONNECTING`.
    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
        *self.last_retry_time.write() = Some(Utc::now());
    }

    /// A message was received and dispatched.
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        super::record_messages_received(1);
    }

    /// An undecodable frame was dropped.
    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        super::record_protocol_error();
    }

    /// A handler failed and was detached.
    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
        super::record_handler_error();
    }

    /// A connection exhausted its retries.
    pub fn record_circuit_open(&self) {
        self.circuit_opens.fetch_add(1, Ordering::Relaxed);
        super::record_circuit_open();
    }

    /// Current number of live connections.
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Take an immutable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.started_at.elapsed();
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::SeqCst),
            active_connections_hwm: self.active_connections_hwm.load(Ordering::SeqCst),
            total_stream_creations: self.total_stream_creations.load(Ordering::SeqCst),
            total_stream_cleanups: self.total_stream_cleanups.load(Ordering::SeqCst),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            last_retry_time: *self.last_retry_time.read(),
            uptime_ms: u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics for one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Connections currently registered.
    pub active_connections: u64,
    /// Highest `active_connections` ever observed; never decreases.
    #[serde(rename = "activeConnectionsHWM")]
    pub active_connections_hwm: u64,
    /// Connections created.
    pub total_stream_creations: u64,
    /// Connections torn down.
    pub total_stream_cleanups: u64,
    /// Times any connection entered `RECONNECTING`.
    pub retry_count: u64,
    /// Most recent retry.
    pub last_retry_time: Option<DateTime<Utc>>,
    /// Milliseconds since the backend was created.
    #[serde(rename = "uptime")]
    pub uptime_ms: u64,
    /// Messages dispatched to handlers.
    pub messages_received: u64,
    /// Frames dropped as undecodable.
    pub protocol_errors: u64,
    /// Handlers detached after failing.
    pub handler_errors: u64,
    /// Circuit-open transitions.
    pub circuit_opens: u64,
}

impl MetricsSnapshot {
    /// Render in Prometheus text exposition format.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_prometheus(&self) -> String {
        let last_retry = self
            .last_retry_time
            .map_or(0.0, |t| t.timestamp_millis() as f64 / 1000.0);
        let uptime = self.uptime_ms as f64 / 1000.0;

        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}");
        };

        metric(
            "stream_manager_active_connections",
            "gauge",
            "Connections currently registered",
            self.active_connections.to_string(),
        );
        metric(
            "stream_manager_active_connections_hwm",
            "gauge",
            "Highest number of simultaneously registered connections",
            self.active_connections_hwm.to_string(),
        );
        metric(
            "stream_manager_stream_creations_total",
            "counter",
            "Connections created",
            self.total_stream_creations.to_string(),
        );
        metric(
            "stream_manager_stream_cleanups_total",
            "counter",
            "Connections torn down",
            self.total_stream_cleanups.to_string(),
        );
        metric(
            "stream_manager_retries_total",
            "counter",
            "Times a connection entered RECONNECTING",
            self.retry_count.to_string(),
        );
        metric(
            "stream_manager_last_retry_timestamp_seconds",
            "gauge",
            "Unix time of the most recent retry (0 if none)",
            last_retry.to_string(),
        );
        metric(
            "stream_manager_uptime_seconds",
            "gauge",
            "Seconds since the backend was created",
            uptime.to_string(),
        );
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_close_track_active_and_totals() {
        let metrics = MetricsCollector::new();
        metrics.record_connection_opened();
        metrics.record_connection_opened();
        metrics.record_connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_stream_creations, 2);
        assert_eq!(snapshot.total_stream_cleanups, 1);
    }

    #[test]
    fn high_water_mark_never_decreases() {
        let metrics = MetricsCollector::new();
        for _ in 0..3 {
            metrics.record_connection_opened();
        }
        for _ in 0..3 {
            metrics.record_connection_closed();
        }
        metrics.record_connection_opened();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.active_connections_hwm, 3);
    }

    #[test]
    fn closing_below_zero_saturates() {
        let metrics = MetricsCollector::new();
        metrics.record_connection_closed();
        assert_eq!(metrics.active_connections(), 0);
    }

    #[test]
    fn retry_records_timestamp() {
        let metrics = MetricsCollector::new();
        assert!(metrics.snapshot().last_retry_time.is_none());

        metrics.record_retry();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retry_count, 1);
        assert!(snapshot.last_retry_time.is_some());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(json.get("activeConnections").is_some());
        assert!(json.get("activeConnectionsHWM").is_some());
        assert!(json.get("totalStreamCreations").is_some());
        assert!(json.get("totalStreamCleanups").is_some());
        assert!(json.get("retryCount").is_some());
        assert!(json.get("lastRetryTime").is_some());
        assert!(json.get("uptime").is_some());
    }

    #[test]
    fn prometheus_lines_are_name_value_pairs() {
        let metrics = MetricsCollector::new();
        metrics.record_connection_opened();
        let text = metrics.snapshot().to_prometheus();

        assert!(text.contains("stream_manager_active_connections 1\n"));
        assert!(text.contains("stream_manager_stream_creations_total 1\n"));
        assert!(text.contains("stream_manager_last_retry_timestamp_seconds 0\n"));

        for line in text.lines().filter(|l| !l.starts_with('#')) {
            let parts: Vec<_> = line.split(' ').collect();
            assert_eq!(parts.len(), 2, "unexpected line {line:?}");
            assert!(parts[1].parse::<f64>().is_ok(), "non-numeric value in {line:?}");
        }
    }
}
