use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "gymsched_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "gymsched_http_request_duration_seconds";

/// Gauge: requests currently being handled.
pub const HTTP_REQUESTS_IN_FLIGHT: &str = "gymsched_http_requests_in_flight";

/// Counter: failed orchestrator calls. Labels: kind.
pub const ENGINE_ERRORS_TOTAL: &str = "gymsched_engine_errors_total";

// ── Booking lifecycle ───────────────────────────────────────────

/// Gauge: sessions held in the store.
pub const SESSIONS_STORED: &str = "gymsched_sessions_stored";

pub const SESSIONS_BOOKED_TOTAL: &str = "gymsched_sessions_booked_total";
pub const SESSIONS_CANCELLED_TOTAL: &str = "gymsched_sessions_cancelled_total";
pub const SESSIONS_COMPLETED_TOTAL: &str = "gymsched_sessions_completed_total";

/// Counter: bookings rejected by the local conflict detector. Labels: party.
pub const BOOKING_CONFLICTS_TOTAL: &str = "gymsched_booking_conflicts_total";

// ── Dependencies ────────────────────────────────────────────────

/// Counter: calls to Members/Trainers. Labels: service, outcome.
pub const REMOTE_CALLS_TOTAL: &str = "gymsched_remote_calls_total";

/// Histogram: remote call latency in seconds. Labels: service.
pub const REMOTE_CALL_DURATION_SECONDS: &str = "gymsched_remote_call_duration_seconds";

/// Counter: events handed to the publisher. Labels: event.
pub const EVENTS_PUBLISHED_TOTAL: &str = "gymsched_events_published_total";

/// Counter: events the publisher failed to deliver. Labels: event.
pub const EVENTS_FAILED_TOTAL: &str = "gymsched_events_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gymsched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (snapshots per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gymsched_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "gymsched_wal_compactions_total";

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

/// Map an engine error to a short label for metrics.
pub fn error_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::SessionNotFound(_) => "session_not_found",
        EngineError::ParticipantNotFound(_) => "participant_not_found",
        EngineError::Conflict(_) => "conflict",
        EngineError::InvalidTransition { .. } => "invalid_transition",
        EngineError::InvalidParticipantState { .. } => "invalid_participant_state",
        EngineError::InvalidInput(_) => "invalid_input",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::WalError(_) => "wal",
    }
}
