//! Outbound delivery to one or many connections

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::metrics::MessageMetrics;

use super::registry::ConnectionRegistry;
use super::types::Connection;

/// Receives every failed send (timeout or transport error).
#[async_trait]
pub trait SendFailureHandler: Send + Sync {
    async fn on_send_failure(&self, connection: &Arc<Connection>, error: &ConnectionError);
}

/// Result of a fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub attempted: usize,
    pub delivered: usize,
}

impl BroadcastOutcome {
    pub fn failed(&self) -> usize {
        self.attempted - self.delivered
    }
}

/// Serialize an outbound payload once, for any number of sends
pub fn serialize_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Arc<str>, ConnectionError> {
    serde_json::to_string(payload)
        .map(Arc::from)
        .map_err(|e| ConnectionError::failed(None, format!("payload serialization failed: {}", e)))
}

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Serialize `payload` and deliver it to one connection.
    pub async fn send_to<T, H>(
        &self,
        connection: &Arc<Connection>,
        payload: &T,
        handler: &H,
    ) -> Result<(), ConnectionError>
    where
        T: Serialize + ?Sized,
        H: SendFailureHandler + ?Sized,
    {
        let text = serialize_payload(payload)?;
        self.send_serialized(connection, &text, handler).await
    }

    /// Deliver an already serialized payload to one connection.
    ///
    /// The payload occupies a slot in the connection's outbound queue for
    /// the duration of the send; a full queue is reported as `QueueFull`
    /// without touching the transport. Timeouts and transport errors are
    /// reported to `handler` and returned, never raised further.
    pub async fn send_serialized<H>(
        &self,
        connection: &Arc<Connection>,
        payload: &Arc<str>,
        handler: &H,
    ) -> Result<(), ConnectionError>
    where
        H: SendFailureHandler + ?Sized,
    {
        if !connection.try_enqueue(payload.clone()) {
            MessageMetrics::record_failed("queue_full");
            return Err(ConnectionError::QueueFull {
                connection_id: connection.id,
                max: connection.max_pending(),
            });
        }

        let outcome = timeout(self.send_timeout, connection.send_text(payload)).await;
        connection.complete_pending();

        let error = match outcome {
            Ok(Ok(())) => {
                connection.record_sent(payload.len());
                connection.throttle().consume();
                connection.mark_active();
                MessageMetrics::record_sent(payload.len());
                return Ok(());
            }
            Ok(Err(e)) => ConnectionError::failed(Some(connection.id), e.to_string()),
            Err(_) => ConnectionError::timeout("send", Some(connection.id)),
        };

        MessageMetrics::record_failed(error.kind());
        tracing::debug!(
            connection_id = %connection.id,
            error = %error,
            "Send failed"
        );
        handler.on_send_failure(connection, &error).await;
        Err(error)
    }

    /// Deliver `payload` to `targets` concurrently.
    ///
    /// Each send is independent: a slow or failing connection neither
    /// aborts nor delays the others beyond its own send timeout.
    pub async fn send_many<H>(
        &self,
        targets: &[Arc<Connection>],
        payload: &Arc<str>,
        handler: &H,
    ) -> Vec<Result<(), ConnectionError>>
    where
        H: SendFailureHandler + ?Sized,
    {
        join_all(
            targets
                .iter()
                .map(|conn| self.send_serialized(conn, payload, handler)),
        )
        .await
    }

    /// Fan `payload` out to every active connection except `exclude`.
    pub async fn broadcast_all<T, H>(
        &self,
        payload: &T,
        exclude: Option<Uuid>,
        handler: &H,
    ) -> Result<BroadcastOutcome, ConnectionError>
    where
        T: Serialize + ?Sized,
        H: SendFailureHandler + ?Sized,
    {
        let text = serialize_payload(payload)?;
        Ok(self.broadcast_serialized(&text, exclude, handler).await)
    }

    pub async fn broadcast_serialized<H>(
        &self,
        text: &Arc<str>,
        exclude: Option<Uuid>,
        handler: &H,
    ) -> BroadcastOutcome
    where
        H: SendFailureHandler + ?Sized,
    {
        let targets: Vec<Arc<Connection>> = self
            .registry
            .all_active()
            .into_iter()
            .filter(|conn| Some(conn.id) != exclude)
            .collect();

        if targets.is_empty() {
            return BroadcastOutcome::default();
        }

        let results = self.send_many(&targets, text, handler).await;
        let outcome = BroadcastOutcome {
            attempted: targets.len(),
            delivered: results.iter().filter(|r| r.is_ok()).count(),
        };

        MessageMetrics::record_broadcast(outcome.delivered as u64);
        tracing::debug!(
            attempted = outcome.attempted,
            delivered = outcome.delivered,
            failed = outcome.failed(),
            "Broadcast completed"
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::registry::RegistryCapacity;
    use crate::connection_manager::types::{ConnectionLimits, ConnectionState};
    use crate::websocket::mock::MockTransport;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingHandler {
        failures: Mutex<Vec<(Uuid, &'static str)>>,
    }

    #[async_trait]
    impl SendFailureHandler for RecordingHandler {
        async fn on_send_failure(&self, connection: &Arc<Connection>, error: &ConnectionError) {
            self.failures.lock().push((connection.id, error.kind()));
        }
    }

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster) {
        let registry = Arc::new(ConnectionRegistry::new(RegistryCapacity {
            max_total: 100,
            max_per_ip: 100,
            max_per_user: 100,
        }));
        let broadcaster = Broadcaster::new(registry.clone(), Duration::from_millis(50));
        (registry, broadcaster)
    }

    fn register(registry: &ConnectionRegistry, transport: &MockTransport) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            transport.boxed(),
            None,
            "peer".into(),
            "127.0.0.1".into(),
            &ConnectionLimits::default(),
        ));
        conn.transition(ConnectionState::Connected);
        registry.add(conn.clone()).unwrap();
        conn
    }

    #[tokio::test]
    async fn test_send_to_updates_counters() {
        let (registry, broadcaster) = setup();
        let handler = RecordingHandler::default();
        let transport = MockTransport::new();
        let conn = register(&registry, &transport);
        let tokens_before = conn.throttle().tokens_remaining();

        broadcaster
            .send_to(&conn, &json!({"text": "hi"}), &handler)
            .await
            .unwrap();

        assert_eq!(transport.sent(), vec![r#"{"text":"hi"}"#.to_string()]);
        assert_eq!(conn.messages_sent(), 1);
        assert_eq!(conn.bytes_sent(), 13);
        assert_eq!(conn.throttle().tokens_remaining(), tokens_before - 1);
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.pending_len(), 0);
        assert!(handler.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_timeout_reports_failure() {
        let (registry, broadcaster) = setup();
        let handler = RecordingHandler::default();
        let conn = register(&registry, &MockTransport::stalling(Duration::from_millis(500)));

        let err = broadcaster
            .send_to(&conn, "slow", &handler)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::Timeout { operation: "send", .. }));
        assert_eq!(handler.failures.lock().as_slice(), &[(conn.id, "timeout")]);
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_counts_partial_failures() {
        let (registry, broadcaster) = setup();
        let handler = RecordingHandler::default();

        let healthy: Vec<MockTransport> = (0..3).map(|_| MockTransport::new()).collect();
        let broken: Vec<MockTransport> = (0..2).map(|_| MockTransport::failing()).collect();
        for transport in healthy.iter().chain(broken.iter()) {
            register(&registry, transport);
        }

        let outcome = broadcaster
            .broadcast_all(&json!({"type": "announcement"}), None, &handler)
            .await
            .unwrap();

        assert_eq!(outcome.attempted, 5);
        assert_eq!(outcome.delivered, 3);
        assert_eq!(outcome.failed(), 2);
        assert_eq!(handler.failures.lock().len(), 2);
        for transport in &healthy {
            assert_eq!(transport.sent().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_slow_peer_does_not_block() {
        let (registry, broadcaster) = setup();
        let handler = RecordingHandler::default();

        let sender_transport = MockTransport::new();
        let sender = register(&registry, &sender_transport);
        let fast = MockTransport::new();
        register(&registry, &fast);
        register(&registry, &MockTransport::stalling(Duration::from_millis(500)));

        let started = std::time::Instant::now();
        let outcome = broadcaster
            .broadcast_all("hello", Some(sender.id), &handler)
            .await
            .unwrap();

        assert_eq!(outcome.attempted, 2);
        assert_eq!(outcome.delivered, 1);
        assert!(sender_transport.sent().is_empty());
        assert_eq!(fast.sent().len(), 1);
        // Bounded by the 50ms send timeout, not the 500ms stall
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
