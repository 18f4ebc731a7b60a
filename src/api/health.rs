//! Health check and statistics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::connection_manager::ManagerMetrics;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionHealthResponse,
    pub circuit_breaker: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub max: usize,
    pub unique_ips: usize,
    pub unique_users: usize,
}

/// GET /health - 200 when healthy, 503 otherwise
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let manager = &state.connection_manager;
    let registry = manager.registry().stats();
    let healthy = manager.is_healthy();

    let (code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            message: manager.status_message(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: manager.uptime_seconds(),
            connections: ConnectionHealthResponse {
                total: registry.total_connections,
                max: manager.limits().max_connections,
                unique_ips: registry.unique_ips,
                unique_users: registry.unique_users,
            },
            circuit_breaker: manager.circuit_breaker().state().as_str().to_string(),
        }),
    )
}

/// GET /stats - full manager snapshot
pub async fn stats(State(state): State<AppState>) -> Json<ManagerMetrics> {
    Json(state.connection_manager.metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::connection_manager::ConnectionManager;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::with_manager(
            Settings::default(),
            Arc::new(ConnectionManager::new()),
        )
    }

    #[tokio::test]
    async fn test_health_reports_unavailable_until_started() {
        let state = state();

        let (code, Json(body)) = health(State(state.clone())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "unhealthy");
        assert_eq!(body.connections.max, 1000);

        state.connection_manager.start();
        let (code, Json(body)) = health(State(state.clone())).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.circuit_breaker, "closed");

        state.connection_manager.stop().await;
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let Json(metrics) = stats(State(state())).await;
        assert_eq!(metrics.max_connections, 1000);
        assert_eq!(metrics.registry.total_connections, 0);
        assert!(!metrics.is_running);
    }
}
