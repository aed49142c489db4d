use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "bookings_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "bookings_request_duration_seconds";

/// Counter: booking workflow stage changes. Labels: from, to.
pub const WORKFLOW_TRANSITIONS_TOTAL: &str = "bookings_workflow_transitions_total";

/// Counter: reservations committed.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "bookings_committed_total";

/// Counter: commits refused because the room was taken in the meantime.
pub const BOOKING_CONFLICTS_TOTAL: &str = "bookings_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: requests currently being handled.
pub const REQUESTS_IN_FLIGHT: &str = "bookings_requests_in_flight";

/// Counter: requests rejected due to the concurrency limit.
pub const REQUESTS_REJECTED_TOTAL: &str = "bookings_requests_rejected_total";

/// Gauge: live guest sessions.
pub const SESSIONS_ACTIVE: &str = "bookings_sessions_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookings_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookings_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
