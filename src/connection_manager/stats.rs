//! Connection statistics and metrics snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::circuit_breaker::CircuitBreakerStats;
use crate::ratelimit::RateLimiterStats;

/// Registry occupancy
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub unique_ips: usize,
    pub unique_users: usize,
    pub by_state: HashMap<String, usize>,
}

/// Lifetime counters kept by the manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerCounters {
    pub connections_created: u64,
    pub connections_rejected: u64,
    pub connections_disconnected: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub broadcasts: u64,
}

/// Full read-side view returned by `ConnectionManager::metrics`
#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetrics {
    pub is_running: bool,
    pub is_healthy: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub max_connections: usize,
    /// Live connections as a fraction of `max_connections`
    pub capacity_utilization: f64,
    pub registry: RegistryStats,
    pub counters: ManagerCounters,
    pub circuit_breaker: CircuitBreakerStats,
    pub rate_limiter: RateLimiterStats,
}
