use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "cadence_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "cadence_query_duration_seconds";

/// Counter: bookings materialized by generation runs.
pub const BOOKINGS_GENERATED_TOTAL: &str = "cadence_bookings_generated_total";

/// Histogram: one generation pass (lock to last append) in seconds.
pub const GENERATION_DURATION_SECONDS: &str = "cadence_generation_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "cadence_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "cadence_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "cadence_connections_rejected_total";

/// Gauge: number of active workspaces (loaded engines).
pub const WORKSPACES_ACTIVE: &str = "cadence_workspaces_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cadence_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "cadence_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertService { .. } => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertRule { .. } => "insert_rule",
        Command::UpdateRule { .. } => "update_rule",
        Command::DeleteRule { .. } => "delete_rule",
        Command::InsertSkipDate { .. } => "insert_skip_date",
        Command::DeleteSkipDate { .. } => "delete_skip_date",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectServices => "select_services",
        Command::SelectRules => "select_rules",
        Command::SelectSkipDates { .. } => "select_skip_dates",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::Generate { .. } => "generate",
    }
}
