use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at};
use uuid::Uuid;

use crate::circuit_breaker::{CallError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::ConnectionError;
use crate::metrics::{CircuitBreakerMetrics, ConnectionMetrics, MessageMetrics, RateLimitMetrics};
use crate::ratelimit::RateLimiter;
use crate::shutdown::ShutdownResult;
use crate::tasks::{CleanupTask, HeartbeatTask};
use crate::websocket::{CloseCode, ServerMessage, Transport};

use super::broadcaster::{serialize_payload, Broadcaster, SendFailureHandler};
use super::events::{ConnectionEvent, EVENT_CHANNEL_CAPACITY};
use super::registry::{ConnectionRegistry, RegistryCapacity};
use super::stats::{ManagerCounters, ManagerMetrics};
use super::types::{
    Connection, ConnectionInfo, ConnectionLimits, ConnectionState, DisconnectReason,
    MAX_CONNECTION_ERRORS,
};

/// Live connections at or above this share of capacity report unhealthy
const HEALTHY_CAPACITY_RATIO: f64 = 0.9;

#[derive(Default)]
struct Counters {
    connections_created: AtomicU64,
    connections_rejected: AtomicU64,
    connections_disconnected: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    broadcasts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ManagerCounters {
        ManagerCounters {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_disconnected: self.connections_disconnected.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }
}

/// Heartbeat and cleanup loops owned by a running manager
struct BackgroundTasks {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Admission control and lifecycle management for real-time connections.
///
/// Every inbound transport goes through `connect`, which applies the
/// circuit breaker, the capacity ceilings and the per-IP sliding window
/// before the connection is registered. Outbound traffic and teardown go
/// through the same instance so that counters, events and the breaker see
/// every operation.
pub struct ConnectionManager {
    limits: ConnectionLimits,
    registry: Arc<ConnectionRegistry>,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    broadcaster: Broadcaster,
    events: broadcast::Sender<ConnectionEvent>,
    counters: Counters,
    running: AtomicBool,
    background: Mutex<Option<BackgroundTasks>>,
    started_at: DateTime<Utc>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(RegistryCapacity {
            max_total: limits.max_connections,
            max_per_ip: limits.max_connections_per_ip,
            max_per_user: limits.max_connections_per_user,
        }));
        let circuit_breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: limits.circuit_breaker_failure_threshold,
            recovery_timeout: limits.circuit_breaker_recovery_timeout,
            ..Default::default()
        });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            rate_limiter: RateLimiter::with_block_duration(limits.rate_limit_block),
            broadcaster: Broadcaster::new(registry.clone(), limits.send_timeout),
            registry,
            circuit_breaker,
            events,
            counters: Counters::default(),
            running: AtomicBool::new(false),
            background: Mutex::new(None),
            started_at: Utc::now(),
            limits,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Launch the heartbeat and cleanup loops. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let heartbeat = HeartbeatTask::new(self.clone(), shutdown_tx.subscribe());
        let cleanup = CleanupTask::new(self.clone(), shutdown_tx.subscribe());
        let handles = vec![
            tokio::spawn(heartbeat.run()),
            tokio::spawn(cleanup.run()),
        ];

        *self.background.lock() = Some(BackgroundTasks {
            shutdown_tx,
            handles,
        });

        tracing::info!(
            max_connections = self.limits.max_connections,
            heartbeat_interval_secs = self.limits.heartbeat_interval.as_secs(),
            cleanup_interval_secs = self.limits.cleanup_interval.as_secs(),
            "Connection manager started"
        );
    }

    /// Stop the background loops and disconnect every connection.
    ///
    /// The whole call is bounded by the shutdown timeout; anything still
    /// registered at the deadline is cleared from the registry without a
    /// close frame. Safe to call repeatedly, and on a manager that never
    /// started.
    pub async fn stop(&self) -> ShutdownResult {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.limits.shutdown_timeout;
        let was_running = self.running.swap(false, Ordering::AcqRel);

        let background = self.background.lock().take();
        if let Some(tasks) = background {
            let _ = tasks.shutdown_tx.send(());
            for mut handle in tasks.handles {
                if timeout_at(deadline, &mut handle).await.is_err() {
                    tracing::warn!("Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        // Teardowns already underway belong to their caller
        let (in_flight, to_close): (Vec<_>, Vec<_>) = self
            .registry
            .all()
            .into_iter()
            .partition(|conn| conn.state() == ConnectionState::Disconnecting);
        let in_flight: HashSet<Uuid> = in_flight.iter().map(|conn| conn.id).collect();

        if !to_close.is_empty() {
            tracing::info!(
                connections = to_close.len(),
                in_flight = in_flight.len(),
                "Disconnecting all connections"
            );
        }

        let closed = AtomicUsize::new(0);
        let drain = join_all(to_close.iter().map(|conn| {
            let closed = &closed;
            async move {
                if self
                    .disconnect(conn.id, DisconnectReason::ServerShutdown)
                    .await
                {
                    closed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
        if timeout_at(deadline, drain).await.is_err() {
            tracing::warn!(
                timeout_ms = self.limits.shutdown_timeout.as_millis() as u64,
                "Shutdown drain timed out, force-clearing registry"
            );
        }

        // Whoever reaches DISCONNECTED first records the teardown
        let mut forced_cleared = 0;
        for conn in self.registry.clear() {
            if self.finish_teardown(&conn, &DisconnectReason::ServerShutdown)
                && !in_flight.contains(&conn.id)
            {
                forced_cleared += 1;
            }
        }
        ConnectionMetrics::set_active(0);

        let result = ShutdownResult {
            was_running,
            connections_closed: closed.load(Ordering::Relaxed),
            forced_cleared,
            duration: started.elapsed(),
        };

        if was_running {
            tracing::info!(
                connections_closed = result.connections_closed,
                forced_cleared = result.forced_cleared,
                duration_ms = result.duration.as_millis() as u64,
                "Connection manager stopped"
            );
        }

        result
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Admit a new transport.
    ///
    /// Checks run in a fixed order: circuit breaker, total capacity, per-IP
    /// capacity, per-user capacity (only with a `user_id`), then the per-IP
    /// sliding window. A rejected transport is closed with a cause-specific
    /// code before the error is returned.
    #[tracing::instrument(
        name = "connection.connect",
        skip_all,
        fields(origin = %origin_address, user_id = ?user_id)
    )]
    pub async fn connect(
        &self,
        transport: Box<dyn Transport>,
        user_id: Option<String>,
        display_name: String,
        origin_address: String,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let mut slot = Some(transport);
        let transport_slot = &mut slot;

        let result = self
            .circuit_breaker
            .call_filtered(
                move || self.admit(transport_slot, user_id, display_name, origin_address),
                ConnectionError::is_breaker_failure,
            )
            .await;
        CircuitBreakerMetrics::set_state(self.circuit_breaker.state());

        match result {
            Ok(connection) => Ok(connection),
            Err(CallError::Failed(error)) => Err(error),
            Err(CallError::Rejected) => {
                CircuitBreakerMetrics::record_rejection();
                Err(self.reject(slot.take(), ConnectionError::CircuitOpen).await)
            }
        }
    }

    async fn admit(
        &self,
        slot: &mut Option<Box<dyn Transport>>,
        user_id: Option<String>,
        display_name: String,
        origin_address: String,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let Some(mut transport) = slot.take() else {
            return Err(ConnectionError::failed(None, "transport already consumed"));
        };

        if let Err(error) = self
            .registry
            .check_admission(&origin_address, user_id.as_deref())
        {
            return Err(self.reject(Some(transport), error).await);
        }

        if !self.rate_limiter.allow(
            &origin_address,
            self.limits.rate_limit_requests,
            self.limits.rate_limit_window,
        ) {
            RateLimitMetrics::record_connect_denied();
            let error = ConnectionError::RateLimitExceeded {
                identifier: origin_address,
                connection_id: None,
            };
            return Err(self.reject(Some(transport), error).await);
        }
        RateLimitMetrics::record_connect_allowed();

        let accepted = match timeout(self.limits.send_timeout, transport.accept()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::failed(None, format!("accept failed: {}", e))),
            Err(_) => Err(ConnectionError::timeout("accept", None)),
        };
        if let Err(error) = accepted {
            return Err(self.reject(Some(transport), error).await);
        }

        let connection = Arc::new(Connection::new(
            transport,
            user_id,
            display_name,
            origin_address,
            &self.limits,
        ));

        // Capacity is checked again under the registry's write lock
        if let Err(error) = self.registry.add(connection.clone()) {
            connection.transition(ConnectionState::Rejected);
            let transport = connection.release_transport(self.limits.send_timeout).await;
            return Err(self.reject(transport, error).await);
        }

        connection.transition(ConnectionState::Connected);
        self.counters
            .connections_created
            .fetch_add(1, Ordering::Relaxed);
        ConnectionMetrics::record_opened();
        ConnectionMetrics::set_active(self.registry.count_total());

        let _ = self.events.send(ConnectionEvent::Connected {
            connection_id: connection.id,
            user_id: connection.user_id.clone(),
            display_name: connection.display_name.clone(),
        });

        tracing::info!(
            connection_id = %connection.id,
            total_connections = self.registry.count_total(),
            "Connection admitted"
        );

        let welcome = ServerMessage::welcome(connection.id, &self.limits);
        if let Err(error) = self.broadcaster.send_to(&connection, &welcome, self).await {
            tracing::warn!(
                connection_id = %connection.id,
                error = %error,
                "Welcome message failed, dropping connection"
            );
            self.disconnect(connection.id, DisconnectReason::WelcomeFailed)
                .await;
            return Err(ConnectionError::failed(
                Some(connection.id),
                format!("welcome failed: {}", error),
            ));
        }

        Ok(connection)
    }

    /// Close a refused transport (bounded) and account for the rejection.
    async fn reject(
        &self,
        transport: Option<Box<dyn Transport>>,
        error: ConnectionError,
    ) -> ConnectionError {
        self.counters
            .connections_rejected
            .fetch_add(1, Ordering::Relaxed);
        ConnectionMetrics::record_rejected(error.kind());

        if let Some(mut transport) = transport {
            let code = CloseCode::for_rejection(&error);
            let reason = error.to_string();
            match timeout(self.limits.send_timeout, transport.close(code, &reason)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Failed to close rejected transport");
                }
                Err(_) => {
                    tracing::debug!("Timed out closing rejected transport");
                }
            }
        }

        tracing::info!(
            kind = error.kind(),
            error = %error,
            "Connection rejected"
        );
        error
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear a connection down. Returns false for unknown ids and when
    /// another caller is already disconnecting it.
    #[tracing::instrument(
        name = "connection.disconnect",
        skip(self, reason),
        fields(reason = %reason)
    )]
    pub async fn disconnect(&self, connection_id: Uuid, reason: DisconnectReason) -> bool {
        let Some(connection) = self.registry.get(connection_id) else {
            return false;
        };
        if !connection.transition(ConnectionState::Disconnecting) {
            return false;
        }

        match connection.release_transport(self.limits.send_timeout).await {
            Some(mut transport) => {
                let close = transport.close(reason.close_code(), reason.as_str());
                match timeout(self.limits.send_timeout, close).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(
                            connection_id = %connection_id,
                            error = %e,
                            "Transport close failed"
                        );
                    }
                    Err(_) => {
                        tracing::debug!(
                            connection_id = %connection_id,
                            "Transport close timed out"
                        );
                    }
                }
            }
            None => {
                tracing::debug!(
                    connection_id = %connection_id,
                    "Transport busy or already released, skipping close frame"
                );
            }
        }

        self.registry.remove(connection_id);
        if self.finish_teardown(&connection, &reason) {
            ConnectionMetrics::set_active(self.registry.count_total());
            tracing::info!(
                connection_id = %connection_id,
                messages_sent = connection.messages_sent(),
                errors = connection.error_count(),
                "Connection disconnected"
            );
        } else {
            tracing::debug!(
                connection_id = %connection_id,
                "Teardown already recorded by shutdown"
            );
        }
        true
    }

    /// Bookkeeping shared by graceful and forced teardown. Runs at most once
    /// per connection: only the caller that moves it to DISCONNECTED records
    /// the close.
    fn finish_teardown(&self, connection: &Connection, reason: &DisconnectReason) -> bool {
        if !connection.transition(ConnectionState::Disconnected) {
            return false;
        }
        self.counters
            .connections_disconnected
            .fetch_add(1, Ordering::Relaxed);

        let lifetime = (Utc::now() - connection.connected_at)
            .to_std()
            .unwrap_or_default();
        ConnectionMetrics::record_closed(reason.metric_label(), lifetime.as_secs_f64());

        let _ = self.events.send(ConnectionEvent::Disconnected {
            connection_id: connection.id,
            user_id: connection.user_id.clone(),
            reason: reason.as_str().to_string(),
        });
        true
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Send `payload` to one connection.
    ///
    /// Returns `Ok(false)` if the id is unknown. The connection's token
    /// allowance, the payload size and the outbound queue are checked (in
    /// that order) before anything is written.
    pub async fn send_message<T>(
        &self,
        connection_id: Uuid,
        payload: &T,
    ) -> Result<bool, ConnectionError>
    where
        T: Serialize + ?Sized,
    {
        let Some(connection) = self.registry.get(connection_id) else {
            return Ok(false);
        };
        let text = serialize_payload(payload)?;

        let result = self
            .circuit_breaker
            .call_filtered(
                || async {
                    if !connection.throttle().has_tokens() {
                        RateLimitMetrics::record_send_denied();
                        return Err(ConnectionError::RateLimitExceeded {
                            identifier: connection_id.to_string(),
                            connection_id: Some(connection_id),
                        });
                    }
                    if text.len() > self.limits.max_message_size {
                        return Err(ConnectionError::MessageTooLarge {
                            connection_id,
                            size: text.len(),
                            max: self.limits.max_message_size,
                        });
                    }
                    if connection.pending_len() >= connection.max_pending() {
                        return Err(ConnectionError::QueueFull {
                            connection_id,
                            max: connection.max_pending(),
                        });
                    }
                    self.broadcaster
                        .send_serialized(&connection, &text, self)
                        .await
                },
                ConnectionError::is_breaker_failure,
            )
            .await;
        CircuitBreakerMetrics::set_state(self.circuit_breaker.state());

        match result {
            Ok(()) => {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(text.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            Err(CallError::Failed(error)) => Err(error),
            Err(CallError::Rejected) => {
                CircuitBreakerMetrics::record_rejection();
                Err(ConnectionError::CircuitOpen)
            }
        }
    }

    /// Send `payload` to every active connection except `exclude`.
    ///
    /// Returns the number of connections that received it. A broadcast that
    /// reached none of its targets counts as one breaker failure.
    pub async fn broadcast_message<T>(&self, payload: &T, exclude: Option<Uuid>) -> usize
    where
        T: Serialize + ?Sized,
    {
        let text = match serialize_payload(payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Broadcast payload could not be serialized");
                return 0;
            }
        };

        let result = self
            .circuit_breaker
            .call_filtered(
                || async {
                    let outcome = self
                        .broadcaster
                        .broadcast_serialized(&text, exclude, self)
                        .await;
                    if outcome.attempted > 0 && outcome.delivered == 0 {
                        return Err(ConnectionError::failed(
                            None,
                            format!("broadcast reached none of {} connections", outcome.attempted),
                        ));
                    }
                    Ok(outcome)
                },
                ConnectionError::is_breaker_failure,
            )
            .await;
        CircuitBreakerMetrics::set_state(self.circuit_breaker.state());
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(outcome) => {
                self.counters
                    .messages_sent
                    .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(
                    (text.len() * outcome.delivered) as u64,
                    Ordering::Relaxed,
                );
                outcome.delivered
            }
            Err(CallError::Failed(error)) => {
                tracing::warn!(error = %error, "Broadcast failed");
                0
            }
            Err(CallError::Rejected) => {
                CircuitBreakerMetrics::record_rejection();
                tracing::warn!("Broadcast refused, circuit breaker is open");
                0
            }
        }
    }

    /// Account for a frame received from the client and publish it.
    ///
    /// Returns false if the connection is no longer registered.
    pub fn record_inbound(&self, connection_id: Uuid, payload: &str) -> bool {
        let Some(connection) = self.registry.get(connection_id) else {
            return false;
        };
        connection.record_inbound(payload.len());
        MessageMetrics::record_received();

        let _ = self.events.send(ConnectionEvent::MessageReceived {
            connection_id,
            user_id: connection.user_id.clone(),
            payload: payload.to_string(),
        });
        true
    }

    /// Lifecycle and inbound message events for the chat layer
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Read side
    // ========================================================================

    pub fn is_healthy(&self) -> bool {
        self.is_running()
            && self.circuit_breaker.state() != CircuitState::Open
            && !self.near_capacity()
    }

    fn near_capacity(&self) -> bool {
        self.registry.count_total() as f64
            >= self.limits.max_connections as f64 * HEALTHY_CAPACITY_RATIO
    }

    pub fn status_message(&self) -> String {
        let total = self.registry.count_total();
        let max = self.limits.max_connections;

        if !self.is_running() {
            "Connection manager is not running".to_string()
        } else if self.circuit_breaker.state() == CircuitState::Open {
            format!("Circuit breaker open, refusing new work ({}/{} connections)", total, max)
        } else if self.near_capacity() {
            format!("Near capacity: {}/{} connections", total, max)
        } else {
            format!("Healthy: {}/{} connections", total, max)
        }
    }

    pub fn metrics(&self) -> ManagerMetrics {
        let registry = self.registry.stats();
        let capacity_utilization = if self.limits.max_connections == 0 {
            1.0
        } else {
            registry.total_connections as f64 / self.limits.max_connections as f64
        };

        ManagerMetrics {
            is_running: self.is_running(),
            is_healthy: self.is_healthy(),
            started_at: self.started_at,
            uptime_seconds: self.uptime_seconds(),
            max_connections: self.limits.max_connections,
            capacity_utilization,
            registry,
            counters: self.counters.snapshot(),
            circuit_breaker: self.circuit_breaker.stats(),
            rate_limiter: self.rate_limiter.stats(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    pub fn connection_info(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        self.registry.get(connection_id).map(|conn| conn.info())
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count_total()
    }

    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Registered connections idle for longer than the connection timeout
    pub fn expired_connections(&self) -> Vec<Arc<Connection>> {
        self.registry
            .all()
            .into_iter()
            .filter(|conn| {
                conn.state() != ConnectionState::Disconnecting
                    && conn.is_expired(self.limits.connection_timeout)
            })
            .collect()
    }

    /// Active connections whose last heartbeat is older than the interval
    pub fn heartbeat_targets(&self) -> Vec<Arc<Connection>> {
        self.registry
            .all_active()
            .into_iter()
            .filter(|conn| conn.heartbeat_due(self.limits.heartbeat_interval))
            .collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SendFailureHandler for ConnectionManager {
    async fn on_send_failure(&self, connection: &Arc<Connection>, error: &ConnectionError) {
        self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
        let errors = connection.record_error();
        connection.transition(ConnectionState::Error);

        tracing::warn!(
            connection_id = %connection.id,
            error = %error,
            error_count = errors,
            "Send to connection failed"
        );

        if errors >= MAX_CONNECTION_ERRORS {
            self.disconnect(connection.id, DisconnectReason::TooManyErrors)
                .await;
        }
    }
}
