//! Prometheus metrics.
//!
//! Pre-registered metrics for production observability. Counters sit on
//! the order and reconcile paths, so everything here is lock-free.

use lazy_static::lazy_static;
use prometheus::{
    opts, register_gauge, register_int_counter, register_int_counter_vec, Encoder, Gauge,
    IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // --- Order flow ---

    /// Orders sent to the gateway (by kind and outcome).
    pub static ref ORDERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("ordersentinel_orders_total", "Orders sent to the gateway"),
        &["kind", "status"]
    ).expect("FATAL: Failed to register ORDERS_TOTAL metric - check for duplicate registration");

    /// Protective order replacements (stop moves, size syncs).
    pub static ref PROTECTIVE_REPLACEMENTS: IntCounterVec = register_int_counter_vec!(
        opts!("ordersentinel_protective_replacements_total", "Protective order replacements"),
        &["kind"]
    ).expect("FATAL: Failed to register PROTECTIVE_REPLACEMENTS metric - check for duplicate registration");

    /// Watchdog repairs of missing or mismatched protective orders.
    pub static ref WATCHDOG_REPAIRS: IntCounterVec = register_int_counter_vec!(
        opts!("ordersentinel_watchdog_repairs_total", "Protective watchdog repairs"),
        &["action"]
    ).expect("FATAL: Failed to register WATCHDOG_REPAIRS metric - check for duplicate registration");

    // --- Reconciliation ---

    /// Reconciliation actions taken against broker state.
    pub static ref RECONCILE_ACTIONS: IntCounterVec = register_int_counter_vec!(
        opts!("ordersentinel_reconcile_actions_total", "Reconciliation actions"),
        &["action"]
    ).expect("FATAL: Failed to register RECONCILE_ACTIONS metric - check for duplicate registration");

    // --- Event channel ---

    /// Quotes received from the event channel.
    pub static ref QUOTES_TOTAL: IntCounter = register_int_counter!(
        opts!("ordersentinel_quotes_total", "Quotes received")
    ).expect("FATAL: Failed to register QUOTES_TOTAL metric - check for duplicate registration");

    /// Hub reconnection attempts.
    pub static ref PUSH_RECONNECTS: IntCounterVec = register_int_counter_vec!(
        opts!("ordersentinel_push_reconnects_total", "Hub reconnection attempts"),
        &["hub"]
    ).expect("FATAL: Failed to register PUSH_RECONNECTS metric - check for duplicate registration");

    // --- Throttling and containment ---

    /// Requests that had to wait for rate-limit headroom.
    pub static ref RATE_LIMIT_WAITS: IntCounterVec = register_int_counter_vec!(
        opts!("ordersentinel_rate_limit_waits_total", "Requests delayed by the rate limiter"),
        &["class"]
    ).expect("FATAL: Failed to register RATE_LIMIT_WAITS metric - check for duplicate registration");

    /// Circuit breaker trips.
    pub static ref BREAKER_TRIPS: IntCounter = register_int_counter!(
        opts!("ordersentinel_breaker_trips_total", "Circuit breaker trips")
    ).expect("FATAL: Failed to register BREAKER_TRIPS metric - check for duplicate registration");

    // --- Account state ---

    /// Realized P&L for the current trading day.
    pub static ref DAILY_PNL: Gauge = register_gauge!(
        opts!("ordersentinel_daily_pnl", "Realized P&L for the current trading day")
    ).expect("FATAL: Failed to register DAILY_PNL metric - check for duplicate registration");

    /// Whether a position is currently open (0 or 1).
    pub static ref POSITION_OPEN: Gauge = register_gauge!(
        opts!("ordersentinel_position_open", "Whether a position is open")
    ).expect("FATAL: Failed to register POSITION_OPEN metric - check for duplicate registration");
}

pub fn record_order(kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    ORDERS_TOTAL.with_label_values(&[kind, status]).inc();
}

pub fn record_protective_replacement(kind: &str) {
    PROTECTIVE_REPLACEMENTS.with_label_values(&[kind]).inc();
}

pub fn record_watchdog_repair(action: &str) {
    WATCHDOG_REPAIRS.with_label_values(&[action]).inc();
}

pub fn record_reconcile_action(action: &str) {
    RECONCILE_ACTIONS.with_label_values(&[action]).inc();
}

pub fn record_quote_received() {
    QUOTES_TOTAL.inc();
}

pub fn record_push_reconnect(hub: &str) {
    PUSH_RECONNECTS.with_label_values(&[hub]).inc();
}

pub fn record_rate_limit_wait(class: &str) {
    RATE_LIMIT_WAITS.with_label_values(&[class]).inc();
}

pub fn record_breaker_trip() {
    BREAKER_TRIPS.inc();
}

pub fn set_daily_pnl(pnl: f64) {
    DAILY_PNL.set(pnl);
}

pub fn set_position_open(open: bool) {
    POSITION_OPEN.set(if open { 1.0 } else { 0.0 });
}

/// Metrics as text for the /metrics endpoint. Encoding problems surface
/// as an empty body, never a panic.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode Prometheus metrics: {}", e);
        return String::new();
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Prometheus metrics buffer is not valid UTF-8: {}", e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accept_labels() {
        record_order("market", true);
        record_order("stop", false);
        record_reconcile_action("adopt_position");
        record_rate_limit_wait("standard");
        set_daily_pnl(-125.5);
        set_position_open(true);
    }

    #[test]
    fn gather_includes_registered_metrics() {
        record_order("market", true);

        let output = gather_metrics();
        assert!(
            output.contains("ordersentinel"),
            "Expected metrics output to contain 'ordersentinel', got: {}",
            &output[..output.len().min(200)]
        );
    }
}
