use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::connection_manager::{serialize_payload, ConnectionManager};
use crate::metrics::HeartbeatMetrics;
use crate::websocket::ServerMessage;

/// Outcome of one heartbeat round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRound {
    pub sent: usize,
    pub failed: usize,
}

/// Background task pinging active connections whose heartbeat is due
pub struct HeartbeatTask {
    connection_manager: Arc<ConnectionManager>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            connection_manager,
            shutdown,
        }
    }

    /// Run until the shutdown signal fires. A round in progress is abandoned
    /// when the signal arrives.
    pub async fn run(self) {
        let Self {
            connection_manager,
            mut shutdown,
        } = self;
        let heartbeat_interval = connection_manager.limits().heartbeat_interval;
        let mut timer = tokio::time::interval(heartbeat_interval);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            heartbeat_interval_ms = heartbeat_interval.as_millis() as u64,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    tokio::select! {
                        _ = heartbeat_round(&connection_manager) => {}
                        _ = shutdown.recv() => {
                            tracing::info!("Heartbeat task received shutdown signal mid-round");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Send a heartbeat to every due connection in parallel.
    ///
    /// Failures go through the manager's error handler like any other send,
    /// so a peer that keeps missing heartbeats is eventually disconnected.
    pub async fn send_heartbeats(&self) -> HeartbeatRound {
        heartbeat_round(&self.connection_manager).await
    }
}

async fn heartbeat_round(manager: &ConnectionManager) -> HeartbeatRound {
    let targets = manager.heartbeat_targets();
    if targets.is_empty() {
        return HeartbeatRound::default();
    }

    let start = Instant::now();
    let status = if manager.is_healthy() {
        "healthy"
    } else {
        "degraded"
    };
    let payload = match serialize_payload(&ServerMessage::heartbeat(status)) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize heartbeat");
            return HeartbeatRound::default();
        }
    };

    let results = manager
        .broadcaster()
        .send_many(&targets, &payload, manager)
        .await;

    let mut round = HeartbeatRound::default();
    for (connection, result) in targets.iter().zip(results) {
        match result {
            Ok(()) => {
                connection.mark_heartbeat();
                round.sent += 1;
            }
            Err(e) => {
                round.failed += 1;
                tracing::debug!(
                    connection_id = %connection.id,
                    error = %e,
                    "Heartbeat not delivered"
                );
            }
        }
    }

    let elapsed_ms = start.elapsed().as_millis() as u64;
    HeartbeatMetrics::record_duration_ms(elapsed_ms);
    if round.failed > 0 {
        HeartbeatMetrics::record_failures(round.failed as u64);
    }

    tracing::debug!(
        total = targets.len(),
        sent = round.sent,
        failed = round.failed,
        elapsed_ms = elapsed_ms,
        "Heartbeat round completed"
    );

    let interval_ms = manager.limits().heartbeat_interval.as_millis() as u64;
    if elapsed_ms > interval_ms / 2 {
        tracing::warn!(
            elapsed_ms = elapsed_ms,
            heartbeat_interval_ms = interval_ms,
            connections = targets.len(),
            "Heartbeat round took more than 50% of interval"
        );
    }

    round
}
