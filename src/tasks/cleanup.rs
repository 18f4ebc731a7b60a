use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast;

use crate::connection_manager::{ConnectionManager, DisconnectReason};
use crate::metrics::CleanupMetrics;

/// Background task evicting idle connections and pruning rate-limit state
pub struct CleanupTask {
    connection_manager: Arc<ConnectionManager>,
    shutdown: broadcast::Receiver<()>,
}

impl CleanupTask {
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            connection_manager,
            shutdown,
        }
    }

    /// Run until the shutdown signal fires. A sweep in progress is abandoned
    /// when the signal arrives.
    pub async fn run(self) {
        let Self {
            connection_manager,
            mut shutdown,
        } = self;
        let cleanup_interval = connection_manager.limits().cleanup_interval;
        let mut timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            cleanup_interval_ms = cleanup_interval.as_millis() as u64,
            connection_timeout_secs = connection_manager.limits().connection_timeout.as_secs(),
            "Cleanup task started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Cleanup task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    tokio::select! {
                        _ = sweep_expired(&connection_manager) => {}
                        _ = shutdown.recv() => {
                            tracing::info!("Cleanup task received shutdown signal mid-sweep");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Cleanup task stopped");
    }

    /// Disconnect every expired connection; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        sweep_expired(&self.connection_manager).await
    }
}

/// Each disconnect is independent, so one that fails or races with another
/// teardown does not hold up the rest of the sweep.
async fn sweep_expired(manager: &ConnectionManager) -> usize {
    let expired = manager.expired_connections();

    let removed = if expired.is_empty() {
        0
    } else {
        let results = join_all(
            expired
                .iter()
                .map(|conn| manager.disconnect(conn.id, DisconnectReason::Expired)),
        )
        .await;
        results.into_iter().filter(|removed| *removed).count()
    };

    let pruned = manager
        .rate_limiter()
        .cleanup_stale(manager.limits().rate_limit_window);

    if removed > 0 {
        CleanupMetrics::record_expired(removed as u64);
        tracing::info!(
            removed = removed,
            timeout_secs = manager.limits().connection_timeout.as_secs(),
            "Cleaned up expired connections"
        );
    }
    if pruned > 0 {
        tracing::debug!(pruned = pruned, "Pruned idle rate limit histories");
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::{ConnectionLimits, ConnectionState};
    use crate::websocket::mock::MockTransport;
    use crate::websocket::CloseCode;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let manager = Arc::new(ConnectionManager::with_limits(ConnectionLimits {
            connection_timeout: Duration::from_millis(60),
            send_timeout: Duration::from_millis(50),
            ..Default::default()
        }));
        let idle_transport = MockTransport::new();
        let idle = manager
            .connect(idle_transport.boxed(), None, "idle".into(), "10.0.0.1".into())
            .await
            .unwrap();
        let busy = manager
            .connect(MockTransport::new().boxed(), None, "busy".into(), "10.0.0.2".into())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.record_inbound(busy.id, "still here");
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (_tx, rx) = broadcast::channel(1);
        let task = CleanupTask::new(manager.clone(), rx);
        assert_eq!(task.sweep().await, 1);

        assert_eq!(idle.state(), ConnectionState::Disconnected);
        assert_eq!(idle_transport.close_code(), Some(CloseCode::NORMAL));
        assert!(manager.registry().get(busy.id).is_some());
        assert_eq!(task.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_loop_reaps_within_one_tick() {
        let manager = Arc::new(ConnectionManager::with_limits(ConnectionLimits {
            connection_timeout: Duration::from_millis(30),
            cleanup_interval: Duration::from_millis(50),
            send_timeout: Duration::from_millis(50),
            ..Default::default()
        }));
        manager
            .connect(MockTransport::new().boxed(), None, "p".into(), "10.0.0.1".into())
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(CleanupTask::new(manager.clone(), shutdown_rx).run());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.connection_count(), 0);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }
}
