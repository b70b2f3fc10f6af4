//! Prometheus metrics for the KRX slot trader.
//!
//! Covers:
//! - Streaming connection state and reconnects
//! - Frame routing and queue drops
//! - Exit triggers, order attempts and broker throttling
//! - Monitor lifecycle and lock contention
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, which is a startup bug. These panics only
//! occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_int_gauge, CounterVec, Gauge, GaugeVec, Histogram, IntGauge,
};

/// WebSocket connection state (1 = connected, 0 = disconnected).
pub static WS_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("krx_ws_connected", "WebSocket connection state (1=connected)").unwrap()
});

/// Labels: state (disconnected/connecting/connected)
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "krx_ws_state",
        "WebSocket state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Total WebSocket reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "krx_ws_reconnect_total",
        "Total WebSocket reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Inbound frames by classification.
/// Labels: kind (quote/keepalive/ack/unrouted/unknown)
pub static WS_FRAMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "krx_ws_frames_total",
        "Inbound WebSocket frames by kind",
        &["kind"]
    )
    .unwrap()
});

/// Quote frames dropped because a monitor queue was full.
pub static QUEUE_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "krx_queue_dropped_total",
        "Quote frames dropped on a full monitor queue",
        &["ticker"]
    )
    .unwrap()
});

/// Tickers currently subscribed on the wire.
pub static SUBSCRIBED_TICKERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("krx_subscribed_tickers", "Tickers currently subscribed").unwrap()
});

/// Exit verdicts by reason.
pub static EXIT_TRIGGERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "krx_exit_triggers_total",
        "Exit verdicts by reason",
        &["reason"]
    )
    .unwrap()
});

/// Broker order placements by side and status.
pub static ORDER_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "krx_order_attempts_total",
        "Broker order placements",
        &["side", "status"]
    )
    .unwrap()
});

/// Reconciler rounds needed per completed order.
pub static RECONCILE_ROUNDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "krx_reconcile_rounds",
        "Broker orders needed to complete one execution",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 20.0]
    )
    .unwrap()
});

/// Per-ticker lock acquisition timeouts.
pub static LOCK_TIMEOUTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "krx_lock_timeouts_total",
        "Position lock acquisition timeouts",
        &["ticker"]
    )
    .unwrap()
});

/// Running position monitors.
pub static ACTIVE_MONITORS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("krx_active_monitors", "Running position monitors").unwrap()
});

/// Monitor terminations by outcome.
pub static MONITOR_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "krx_monitor_outcomes_total",
        "Position monitor terminations by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Alerts raised.
pub static ALERTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "krx_alerts_total",
        "Operator alerts raised",
        &["kind", "severity"]
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    // =========================================================================
    // Streaming connection
    // =========================================================================

    pub fn ws_connected() {
        WS_CONNECTED.set(1.0);
    }

    pub fn ws_disconnected() {
        WS_CONNECTED.set(0.0);
    }

    /// Only the active state is set to 1, all others to 0.
    pub fn ws_state_set(state: &str) {
        for s in &["disconnected", "connecting", "connected"] {
            WS_STATE.with_label_values(&[s]).set(0.0);
        }
        WS_STATE.with_label_values(&[state]).set(1.0);
    }

    pub fn ws_reconnect(reason: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn ws_frame(kind: &str) {
        WS_FRAMES_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn queue_dropped(ticker: &str) {
        QUEUE_DROPPED_TOTAL.with_label_values(&[ticker]).inc();
    }

    pub fn subscribed_set(count: usize) {
        SUBSCRIBED_TICKERS.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    // =========================================================================
    // Orders
    // =========================================================================

    pub fn exit_triggered(reason: &str) {
        EXIT_TRIGGERS_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn order_attempt(side: &str, status: &str) {
        ORDER_ATTEMPTS_TOTAL.with_label_values(&[side, status]).inc();
    }

    pub fn reconcile_rounds(rounds: usize) {
        RECONCILE_ROUNDS.observe(rounds as f64);
    }

    // =========================================================================
    // Monitors
    // =========================================================================

    pub fn lock_timeout(ticker: &str) {
        LOCK_TIMEOUTS_TOTAL.with_label_values(&[ticker]).inc();
    }

    pub fn monitor_started() {
        ACTIVE_MONITORS.inc();
    }

    pub fn monitor_stopped(outcome: &str) {
        ACTIVE_MONITORS.dec();
        MONITOR_OUTCOMES_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn alert_raised(kind: &str, severity: &str) {
        ALERTS_TOTAL.with_label_values(&[kind, severity]).inc();
    }
}
