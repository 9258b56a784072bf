use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fieldbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fieldbook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservations created. Labels: resource.
pub const RESERVATIONS_CREATED_TOTAL: &str = "fieldbook_reservations_created_total";

/// Counter: create attempts refused. Labels: reason (error code).
pub const RESERVATIONS_REJECTED_TOTAL: &str = "fieldbook_reservations_rejected_total";

/// Counter: reservations cancelled by their owner.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "fieldbook_reservations_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fieldbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fieldbook_connections_total";

/// Counter: logins refused at startup. Labels: reason.
pub const LOGINS_REJECTED_TOTAL: &str = "fieldbook_logins_rejected_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fieldbook_connections_rejected_total";

/// Gauge: venues with a loaded engine.
pub const VENUES_ACTIVE: &str = "fieldbook_venues_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fieldbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fieldbook_wal_flush_batch_size";

/// Counter: background compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "fieldbook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
