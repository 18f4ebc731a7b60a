//! Prometheus metrics for the gateway.
//!
//! - Connection metrics (active, opened, closed by reason, rejected by cause)
//! - Message metrics (sent, failed by kind, received, broadcast deliveries)
//! - Heartbeat and cleanup loop metrics
//! - Circuit breaker and rate limiting metrics

mod helpers;

pub use helpers::{
    encode_metrics, CircuitBreakerMetrics, CleanupMetrics, ConnectionMetrics, HeartbeatMetrics,
    MessageMetrics, RateLimitMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "gateway";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Connections currently registered
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Connections currently registered"
    ).unwrap();

    /// Connections admitted
    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections admitted"
    ).unwrap();

    /// Connections refused at admission, by cause
    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_rejected_total", METRIC_PREFIX),
        "Total connections rejected at admission",
        &["cause"]
    ).unwrap();

    /// Connections torn down, by reason
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections disconnected",
        &["reason"]
    ).unwrap();

    /// Connection lifetime
    pub static ref CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_connection_duration_seconds", METRIC_PREFIX),
        "Connection lifetime in seconds",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Frames written to transports
    pub static ref MESSAGES_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total frames written to connections"
    ).unwrap();

    /// Bytes written to transports
    pub static ref BYTES_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_bytes_sent_total", METRIC_PREFIX),
        "Total payload bytes written to connections"
    ).unwrap();

    /// Send failures, by error kind
    pub static ref SEND_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_send_failures_total", METRIC_PREFIX),
        "Total failed sends",
        &["kind"]
    ).unwrap();

    /// Frames received from clients
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total frames received from clients"
    ).unwrap();

    /// Broadcast fan-outs
    pub static ref BROADCASTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broadcasts_total", METRIC_PREFIX),
        "Total broadcasts"
    ).unwrap();

    /// Successful deliveries per broadcast
    pub static ref BROADCAST_DELIVERIES: Histogram = register_histogram!(
        format!("{}_broadcast_deliveries", METRIC_PREFIX),
        "Connections reached per broadcast",
        vec![0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // ============================================================================
    // Heartbeat & Cleanup Metrics
    // ============================================================================

    /// Heartbeat round duration in milliseconds
    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Heartbeat round duration in milliseconds",
        vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    ).unwrap();

    /// Heartbeats that could not be delivered
    pub static ref HEARTBEAT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_heartbeat_failures_total", METRIC_PREFIX),
        "Total heartbeat sends that failed or timed out"
    ).unwrap();

    /// Connections reaped for inactivity
    pub static ref CLEANUP_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_cleanup_expired_total", METRIC_PREFIX),
        "Total connections disconnected for inactivity"
    ).unwrap();

    // ============================================================================
    // Circuit Breaker & Rate Limiting Metrics
    // ============================================================================

    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref CIRCUIT_BREAKER_STATE: IntGauge = register_int_gauge!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Circuit breaker state (0=closed, 1=open, 2=half-open)"
    ).unwrap();

    /// Calls refused by an open circuit
    pub static ref CIRCUIT_BREAKER_REJECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_circuit_breaker_rejections_total", METRIC_PREFIX),
        "Total operations refused while the circuit was open"
    ).unwrap();

    /// Requests allowed by rate limiting
    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Total requests allowed by rate limiting",
        &["type"]
    ).unwrap();

    /// Requests denied by rate limiting
    pub static ref RATELIMIT_DENIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_denied_total", METRIC_PREFIX),
        "Total requests denied by rate limiting",
        &["type"]
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        // lazy_static metrics register on first access
        CONNECTIONS_ACTIVE.set(1);

        let output = encode_metrics().unwrap();
        assert!(output.contains("gateway_connections_active"));
    }

    #[test]
    fn test_labelled_counters() {
        CONNECTIONS_REJECTED_TOTAL
            .with_label_values(&["capacity_exceeded"])
            .inc();
        CONNECTIONS_CLOSED_TOTAL.with_label_values(&["expired"]).inc();
        SEND_FAILURES_TOTAL.with_label_values(&["timeout"]).inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("gateway_connections_rejected_total"));
        assert!(output.contains("cause=\"capacity_exceeded\""));
    }
}
