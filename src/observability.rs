use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "barberslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "barberslot_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (booked, conflict, invalid, error).
pub const BOOKINGS_TOTAL: &str = "barberslot_bookings_total";

/// Counter: slot list computations.
pub const SLOT_QUERIES_TOTAL: &str = "barberslot_slot_queries_total";

/// Counter: store calls abandoned after the client-side timeout. Labels: op.
pub const STORE_TIMEOUTS_TOTAL: &str = "barberslot_store_timeouts_total";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "barberslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "barberslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "barberslot_connections_rejected_total";

/// Gauge: shops with an open store.
pub const SHOPS_ACTIVE: &str = "barberslot_shops_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "barberslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "barberslot_wal_flush_batch_size";

/// Counter: WAL rewrites by the compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "barberslot_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, used on query metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectSettings => "select_settings",
        Command::UpdateSettings { .. } => "update_settings",
        Command::SelectServices => "select_services",
        Command::InsertService { .. } => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::DeleteService { .. } => "delete_service",
        Command::SelectDays { .. } => "select_days",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectHandoff { .. } => "select_handoff",
        Command::SelectExpenses => "select_expenses",
        Command::InsertExpense { .. } => "insert_expense",
        Command::DeleteExpense { .. } => "delete_expense",
        Command::SelectDashboard { .. } => "select_dashboard",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
