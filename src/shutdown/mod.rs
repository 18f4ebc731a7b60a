//! Graceful shutdown handling for the gateway.
//!
//! The process shuts down in two stages:
//! 1. An OS signal stops the HTTP listener from accepting new upgrades
//! 2. `ConnectionManager::stop` cancels the background loops and drains the
//!    registry, force-clearing whatever is left after the shutdown timeout

use std::time::Duration;

use serde::Serialize;
use tokio::signal;

/// Result of `ConnectionManager::stop`
#[derive(Debug, Default, Clone, Serialize)]
pub struct ShutdownResult {
    /// Whether the manager was running when `stop` was called
    pub was_running: bool,
    /// Connections `stop` itself disconnected (close frame attempted).
    /// Teardowns already underway elsewhere are not counted.
    pub connections_closed: usize,
    /// Connections dropped from the registry after the shutdown timeout
    pub forced_cleared: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}

impl ShutdownResult {
    /// Every connection was closed before the shutdown timeout
    pub fn is_clean(&self) -> bool {
        self.forced_cleared == 0
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
