use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotwise_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotwise_request_duration_seconds";

/// Histogram: availability computation latency in seconds.
pub const AVAILABILITY_DURATION_SECONDS: &str = "slotwise_availability_duration_seconds";

/// Counter: booking commits. Labels: kind, outcome.
pub const COMMITS_TOTAL: &str = "slotwise_commits_total";

/// Counter: busy-time fetches served without (some) provider data. Labels: cause.
pub const PROVIDER_DEGRADED_TOTAL: &str = "slotwise_provider_degraded_total";

/// Counter: commits where the external calendar and local record disagree.
pub const PARTIAL_COMMITS_TOTAL: &str = "slotwise_partial_commits_total";

/// Counter: notification deliveries. Labels: outcome.
pub const NOTIFICATIONS_TOTAL: &str = "slotwise_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Counter: connections that failed the token check.
pub const AUTH_FAILURES_TOTAL: &str = "slotwise_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::Ping => "ping",
        Request::Availability { .. } => "availability",
        Request::Commit { .. } => "commit",
        Request::SetStatus { .. } => "set_status",
        Request::CancelReservation { .. } => "cancel_reservation",
        Request::Capacity { .. } => "capacity",
        Request::UpsertBusiness { .. } => "upsert_business",
        Request::UpsertItem { .. } => "upsert_item",
        Request::Bookings { .. } => "bookings",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
