//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Unread state
    pub static ref UNREAD_CONVERSATIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("versus_unread_conversations", "Conversations currently marked unread across sessions"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref READ_CURSOR_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("versus_read_cursor_writes_total", "Read-cursor upserts by outcome"),
        &["kind", "outcome"]
    ).expect("metric can be created");
    pub static ref READ_ROLLBACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("versus_read_rollbacks_total", "Optimistic read marks reverted after a failed write"),
        &["kind"]
    ).expect("metric can be created");

    // Realtime
    pub static ref REALTIME_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("versus_realtime_events_total", "Change events delivered to listeners"),
        &["table", "event"]
    ).expect("metric can be created");
    pub static ref RESUBSCRIPTIONS_TOTAL: IntCounter = IntCounter::new(
        "versus_resubscriptions_total",
        "Listeners rebuilt after a dropped or lagging transport"
    ).expect("metric can be created");

    pub static ref OPEN_SESSIONS: IntGauge = IntGauge::new(
        "versus_open_sessions",
        "Unread sessions currently open"
    ).expect("metric can be created");
    pub static ref REALTIME_LISTENERS: IntGauge = IntGauge::new(
        "versus_realtime_listeners",
        "Receivers attached to the change feed"
    ).expect("metric can be created");

    // Notifications
    pub static ref TOASTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("versus_toasts_total", "Toasts by delivery decision"),
        &["decision"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("versus_errors_total", "Total number of errors"),
        &["error_type", "source"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(UNREAD_CONVERSATIONS.clone()))
        .expect("UNREAD_CONVERSATIONS can be registered");
    REGISTRY
        .register(Box::new(READ_CURSOR_WRITES_TOTAL.clone()))
        .expect("READ_CURSOR_WRITES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(READ_ROLLBACKS_TOTAL.clone()))
        .expect("READ_ROLLBACKS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(REALTIME_EVENTS_TOTAL.clone()))
        .expect("REALTIME_EVENTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(RESUBSCRIPTIONS_TOTAL.clone()))
        .expect("RESUBSCRIPTIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(OPEN_SESSIONS.clone()))
        .expect("OPEN_SESSIONS can be registered");
    REGISTRY
        .register(Box::new(REALTIME_LISTENERS.clone()))
        .expect("REALTIME_LISTENERS can be registered");
    REGISTRY
        .register(Box::new(TOASTS_TOTAL.clone()))
        .expect("TOASTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
