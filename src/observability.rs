use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtside_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtside_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (`created` or an error label).
pub const BOOKINGS_TOTAL: &str = "courtside_bookings_total";

/// Histogram: time spent waiting for a ledger partition lock, in seconds.
pub const LEDGER_LOCK_WAIT_SECONDS: &str = "courtside_ledger_lock_wait_seconds";

/// Counter: post-commit side effects that failed. Labels: kind (`payment_link`, `notify`).
pub const DISPATCH_FAILURES_TOTAL: &str = "courtside_dispatch_failures_total";

/// Counter: confirmed bookings moved to completed by the sweeper.
pub const BOOKINGS_SWEPT_TOTAL: &str = "courtside_bookings_swept_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtside_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtside_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtside_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "courtside_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVenue { .. } => "insert_venue",
        Command::DeleteVenue { .. } => "delete_venue",
        Command::InsertArena { .. } => "insert_arena",
        Command::DeleteArena { .. } => "delete_arena",
        Command::InsertSlot { .. } => "insert_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertPlayer { .. } => "insert_player",
        Command::InsertBooking(_) => "insert_booking",
        Command::InsertPayment { .. } => "insert_payment",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectVenues => "select_venues",
        Command::SelectArenas { .. } => "select_arenas",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectPlayers { .. } => "select_players",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
