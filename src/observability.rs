use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservation attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "slotbook_reservations_total";

/// Histogram: reserve latency in seconds.
pub const RESERVE_DURATION_SECONDS: &str = "slotbook_reserve_duration_seconds";

/// Counter: cancellations. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "slotbook_cancellations_total";

/// Counter: reservations rejected because the slot was at capacity.
pub const SLOT_FULL_TOTAL: &str = "slotbook_slot_full_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: compare-and-increment retries on slot counter contention.
pub const COUNTER_RETRIES_TOTAL: &str = "slotbook_counter_retries_total";

/// Counter: compensating releases after a failed booking write.
pub const COMPENSATIONS_TOTAL: &str = "slotbook_compensations_total";

/// Gauge: live change subscriptions.
pub const SUBSCRIPTIONS_ACTIVE: &str = "slotbook_subscriptions_active";

/// Counter: notification records created.
pub const NOTIFICATIONS_CREATED_TOTAL: &str = "slotbook_notifications_created_total";

/// Counter: push deliveries that failed (invalid token or channel outage).
pub const PUSH_FAILURES_TOTAL: &str = "slotbook_push_failures_total";

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
