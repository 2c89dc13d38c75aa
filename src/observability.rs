use std::net::SocketAddr;

use thiserror::Error;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: bookings persisted. Labels: origin (`direct` | `recurrence`).
pub const BOOKINGS_CREATED_TOTAL: &str = "roombook_bookings_created_total";

/// Counter: candidates rejected by the validator. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "roombook_bookings_rejected_total";

/// Counter: lifecycle transitions attempted. Labels: action, outcome.
pub const TRANSITIONS_TOTAL: &str = "roombook_transitions_total";

/// Counter: recurrence occurrences processed. Labels: outcome (`created` | `conflict`).
pub const RECURRENCE_OCCURRENCES_TOTAL: &str = "roombook_recurrence_occurrences_total";

/// Histogram: calendar generation latency in seconds.
pub const CALENDAR_DURATION_SECONDS: &str = "roombook_calendar_duration_seconds";

// ── Background work ─────────────────────────────────────────────

/// Counter: sweep results. Labels: kind (`confirmation_request` | `auto_cancel` | `reminder`).
pub const SWEEP_ACTIONS_TOTAL: &str = "roombook_sweep_actions_total";

/// Gauge: rooms loaded.
pub const ROOMS_ACTIVE: &str = "roombook_rooms_active";

/// Counter: log compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "roombook_wal_compactions_total";

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

#[derive(Debug, Error)]
#[error("failed to install Prometheus exporter on port {port}: {source}")]
pub struct ExporterError {
    port: u16,
    #[source]
    source: metrics_exporter_prometheus::BuildError,
}

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), ExporterError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|source| ExporterError { port, source })?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
