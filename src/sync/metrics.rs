//! Prometheus metrics for the sync engine
//!
//! Exported as text at `GET /metrics` by the control-plane API.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Histogram: poll cycle duration (seconds)
    pub static ref POLL_DURATION: HistogramVec = register_histogram_vec!(
        "mailsync_poll_duration_seconds",
        "Duration of mailbox poll cycles",
        &["outcome"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to create poll_duration metric");

    /// Counter: messages by pipeline outcome (stored, duplicate, skipped)
    pub static ref MESSAGES: CounterVec = register_counter_vec!(
        "mailsync_messages_total",
        "Messages processed by the pipeline, by outcome",
        &["outcome"]
    )
    .expect("Failed to create messages metric");

    /// Counter: connection failures by kind (auth, transient)
    pub static ref CONNECTION_FAILURES: CounterVec = register_counter_vec!(
        "mailsync_connection_failures_total",
        "Connection failures by kind",
        &["kind"]
    )
    .expect("Failed to create connection_failures metric");

    /// Counter: poll cycles halted early, by error kind
    pub static ref SYNC_ERRORS: CounterVec = register_counter_vec!(
        "mailsync_sync_errors_total",
        "Poll cycles halted early, by error kind",
        &["kind"]
    )
    .expect("Failed to create sync_errors metric");

    /// Counter: notification deliveries by status
    pub static ref NOTIFICATIONS: CounterVec = register_counter_vec!(
        "mailsync_notifications_total",
        "Notification deliveries by status",
        &["status"]
    )
    .expect("Failed to create notifications metric");

    /// Gauge: managers per lifecycle state
    pub static ref MANAGERS: GaugeVec = register_gauge_vec!(
        "mailsync_managers",
        "Mailbox managers by lifecycle state",
        &["state"]
    )
    .expect("Failed to create managers metric");

    /// Gauge: mailboxes currently managed by this instance
    pub static ref MANAGED_MAILBOXES: Gauge = register_gauge!(
        "mailsync_managed_mailboxes",
        "Number of mailboxes managed by this instance"
    )
    .expect("Failed to create managed_mailboxes metric");

    /// Counter: reconcile cycles by status
    pub static ref RECONCILE_CYCLES: CounterVec = register_counter_vec!(
        "mailsync_reconcile_cycles_total",
        "Reconcile cycles by status",
        &["status"]
    )
    .expect("Failed to create reconcile_cycles metric");

    /// Gauge: daemon health status (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "mailsync_health_status",
        "Daemon health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");
}

/// Record a poll cycle duration
pub fn record_poll_duration(outcome: &str, duration_secs: f64) {
    POLL_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn record_message(outcome: &str) {
    MESSAGES.with_label_values(&[outcome]).inc();
}

pub fn record_connection_failure(kind: &str) {
    CONNECTION_FAILURES.with_label_values(&[kind]).inc();
}

pub fn record_sync_error(kind: &str) {
    SYNC_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_notification(status: &str) {
    NOTIFICATIONS.with_label_values(&[status]).inc();
}

/// Replace the per-state manager counts
pub fn set_manager_states<'a>(counts: impl IntoIterator<Item = (&'a str, usize)>) {
    MANAGERS.reset();
    for (state, count) in counts {
        MANAGERS.with_label_values(&[state]).set(count as f64);
    }
}

pub fn set_managed_mailboxes(count: usize) {
    MANAGED_MAILBOXES.set(count as f64);
}

pub fn record_reconcile_cycle(status: &str) {
    RECONCILE_CYCLES.with_label_values(&[status]).inc();
}

/// Set health status
pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
