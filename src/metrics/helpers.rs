//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::circuit_breaker::CircuitState;

use super::{
    BROADCASTS_TOTAL, BROADCAST_DELIVERIES, BYTES_SENT_TOTAL, CIRCUIT_BREAKER_REJECTIONS_TOTAL,
    CIRCUIT_BREAKER_STATE, CLEANUP_EXPIRED_TOTAL, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL,
    CONNECTIONS_OPENED_TOTAL, CONNECTIONS_REJECTED_TOTAL, CONNECTION_DURATION,
    HEARTBEAT_DURATION_MS, HEARTBEAT_FAILURES_TOTAL, MESSAGES_RECEIVED_TOTAL, MESSAGES_SENT_TOTAL,
    RATELIMIT_ALLOWED_TOTAL, RATELIMIT_DENIED_TOTAL, SEND_FAILURES_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        CONNECTIONS_OPENED_TOTAL.inc();
    }

    /// `cause` is a `ConnectionError::kind()` label
    pub fn record_rejected(cause: &str) {
        CONNECTIONS_REJECTED_TOTAL.with_label_values(&[cause]).inc();
    }

    pub fn record_closed(reason: &str, lifetime_secs: f64) {
        CONNECTIONS_CLOSED_TOTAL.with_label_values(&[reason]).inc();
        CONNECTION_DURATION.observe(lifetime_secs);
    }

    pub fn set_active(count: usize) {
        CONNECTIONS_ACTIVE.set(count as i64);
    }
}

/// Helper struct for recording message metrics
pub struct MessageMetrics;

impl MessageMetrics {
    pub fn record_sent(bytes: usize) {
        MESSAGES_SENT_TOTAL.inc();
        BYTES_SENT_TOTAL.inc_by(bytes as u64);
    }

    pub fn record_failed(kind: &str) {
        SEND_FAILURES_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn record_received() {
        MESSAGES_RECEIVED_TOTAL.inc();
    }

    /// Record a broadcast and how many connections it reached
    pub fn record_broadcast(delivered: u64) {
        BROADCASTS_TOTAL.inc();
        BROADCAST_DELIVERIES.observe(delivered as f64);
    }
}

/// Helper struct for heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    /// Record heartbeat round duration
    pub fn record_duration_ms(duration_ms: u64) {
        HEARTBEAT_DURATION_MS.observe(duration_ms as f64);
    }

    pub fn record_failures(count: u64) {
        HEARTBEAT_FAILURES_TOTAL.inc_by(count);
    }
}

/// Helper struct for the inactivity sweep
pub struct CleanupMetrics;

impl CleanupMetrics {
    pub fn record_expired(count: u64) {
        CLEANUP_EXPIRED_TOTAL.inc_by(count);
    }
}

/// Helper struct for circuit breaker metrics
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    pub fn set_state(state: CircuitState) {
        CIRCUIT_BREAKER_STATE.set(state as i64);
    }

    pub fn record_rejection() {
        CIRCUIT_BREAKER_REJECTIONS_TOTAL.inc();
    }
}

/// Helper struct for recording rate limit metrics
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    /// Record an admission allowed by the per-IP sliding window
    pub fn record_connect_allowed() {
        RATELIMIT_ALLOWED_TOTAL.with_label_values(&["connect"]).inc();
    }

    /// Record an admission denied by the per-IP sliding window
    pub fn record_connect_denied() {
        RATELIMIT_DENIED_TOTAL.with_label_values(&["connect"]).inc();
    }

    /// Record a send refused by a connection's token allowance
    pub fn record_send_denied() {
        RATELIMIT_DENIED_TOTAL.with_label_values(&["send"]).inc();
    }
}
