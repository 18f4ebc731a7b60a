//! Connection entity, lifecycle states and limits

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::ratelimit::ConnectionThrottle;
use crate::websocket::{CloseCode, Transport, TransportError};

/// Send failures after which a connection is forcibly disconnected
pub const MAX_CONNECTION_ERRORS: u32 = 5;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lifecycle state of a connection.
///
/// States only move forward in declaration order, with two exceptions:
/// `Rejected` is reachable only from `Connecting`, and `Error` may be
/// entered from any live state and left either back to `Active` (after a
/// successful send) or towards teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Authenticated = 2,
    Active = 3,
    Idle = 4,
    Disconnecting = 5,
    Disconnected = 6,
    Rejected = 7,
    Error = 8,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Authenticated,
            3 => Self::Active,
            4 => Self::Idle,
            5 => Self::Disconnecting,
            6 => Self::Disconnected,
            7 => Self::Rejected,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Active => "ACTIVE",
            Self::Idle => "IDLE",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Rejected => "REJECTED",
            Self::Error => "ERROR",
        }
    }

    /// Eligible for broadcast and heartbeat fan-out
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connected | Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Rejected)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Disconnected | Rejected, _) => false,
            (Connecting, Rejected) => true,
            (_, Rejected) => false,
            (Disconnecting, Error) => false,
            (Error, Error) => false,
            (_, Error) => true,
            (Error, Active | Disconnecting | Disconnected) => true,
            (Error, _) => false,
            (from, to) => (to as u8) > (from as u8),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Expired,
    ServerShutdown,
    TooManyErrors,
    WelcomeFailed,
    ClientClosed,
    Other(String),
}

impl DisconnectReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Expired => "expired",
            Self::ServerShutdown => "server shutdown",
            Self::TooManyErrors => "too many errors",
            Self::WelcomeFailed => "welcome failed",
            Self::ClientClosed => "client closed",
            Self::Other(reason) => reason,
        }
    }

    /// Bounded label for metrics; free-form reasons collapse to "other"
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::ServerShutdown => "server_shutdown",
            Self::TooManyErrors => "too_many_errors",
            Self::WelcomeFailed => "welcome_failed",
            Self::ClientClosed => "client_closed",
            Self::Other(_) => "other",
        }
    }

    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::ServerShutdown => CloseCode::GOING_AWAY,
            Self::TooManyErrors | Self::WelcomeFailed => CloseCode::INTERNAL_ERROR,
            Self::Expired | Self::ClientClosed | Self::Other(_) => CloseCode::NORMAL,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable limits for one `ConnectionManager`
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub max_connections_per_user: usize,
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_block: Duration,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_recovery_timeout: Duration,
    pub send_timeout: Duration,
    pub cleanup_interval: Duration,
    pub max_message_size: usize,
    pub max_pending_messages: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectionLimits {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
            max_connections_per_user: config.max_connections_per_user,
            connection_timeout: Duration::from_secs(config.connection_timeout_seconds),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            rate_limit_requests: config.rate_limit_requests_per_window,
            rate_limit_window: Duration::from_secs(config.rate_limit_window_seconds),
            rate_limit_block: Duration::from_secs(config.rate_limit_block_seconds),
            circuit_breaker_failure_threshold: config.circuit_breaker_failure_threshold,
            circuit_breaker_recovery_timeout: Duration::from_secs(
                config.circuit_breaker_recovery_seconds,
            ),
            send_timeout: Duration::from_secs(config.send_timeout_seconds),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
            max_message_size: config.max_message_bytes,
            max_pending_messages: config.max_pending_messages,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_seconds),
        }
    }
}

/// One live transport session
pub struct Connection {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub display_name: String,
    pub origin_address: String,
    pub connected_at: DateTime<Utc>,
    state: AtomicU8,
    /// Unix milliseconds
    last_activity: AtomicI64,
    /// Unix milliseconds
    last_heartbeat: AtomicI64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    error_count: AtomicU32,
    throttle: ConnectionThrottle,
    pending: Mutex<VecDeque<Arc<str>>>,
    max_pending: usize,
    transport: AsyncMutex<Option<Box<dyn Transport>>>,
}

impl Connection {
    pub fn new(
        transport: Box<dyn Transport>,
        user_id: Option<String>,
        display_name: String,
        origin_address: String,
        limits: &ConnectionLimits,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            display_name,
            origin_address,
            connected_at: now,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_activity: AtomicI64::new(now.timestamp_millis()),
            last_heartbeat: AtomicI64::new(now.timestamp_millis()),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            error_count: AtomicU32::new(0),
            throttle: ConnectionThrottle::new(limits.rate_limit_requests, limits.rate_limit_window),
            pending: Mutex::new(VecDeque::new()),
            max_pending: limits.max_pending_messages,
            transport: AsyncMutex::new(Some(transport)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if the lifecycle allows it; returns whether it moved.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !ConnectionState::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Promote to `Active` after traffic; a no-op for states past `Active`.
    pub fn mark_active(&self) {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Authenticated | ConnectionState::Error
        ) {
            self.transition(ConnectionState::Active);
        }
    }

    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    /// Account for an inbound frame of `bytes` bytes
    pub fn record_inbound(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Increment the error counter, returning the new total
    pub fn record_error(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn mark_heartbeat(&self) {
        self.last_heartbeat.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_heartbeat.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    /// No inbound activity for longer than `timeout`
    pub fn is_expired(&self, timeout: Duration) -> bool {
        now_ms() - self.last_activity.load(Ordering::Relaxed) > timeout.as_millis() as i64
    }

    /// Last heartbeat is older than `interval`
    pub fn heartbeat_due(&self, interval: Duration) -> bool {
        now_ms() - self.last_heartbeat.load(Ordering::Relaxed) > interval.as_millis() as i64
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn throttle(&self) -> &ConnectionThrottle {
        &self.throttle
    }

    /// Reserve a slot in the outbound queue; false when it is full.
    pub fn try_enqueue(&self, payload: Arc<str>) -> bool {
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            return false;
        }
        pending.push_back(payload);
        true
    }

    /// Release the oldest queued payload once its send has finished
    pub fn complete_pending(&self) {
        self.pending.lock().pop_front();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Write a text frame to the owned transport
    pub async fn send_text(&self, payload: &str) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        match transport.as_mut() {
            Some(transport) => transport.send_text(payload).await,
            None => Err(TransportError::Closed),
        }
    }

    /// Take ownership of the transport for closing.
    ///
    /// Returns `None` if it was already released, or if an in-flight send
    /// still holds it after `wait`.
    pub async fn release_transport(&self, wait: Duration) -> Option<Box<dyn Transport>> {
        match tokio::time::timeout(wait, self.transport.lock()).await {
            Ok(mut transport) => transport.take(),
            Err(_) => None,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            origin_address: self.origin_address.clone(),
            state: self.state(),
            connected_at: self.connected_at,
            last_activity_at: self.last_activity(),
            last_heartbeat_at: self.last_heartbeat(),
            messages_sent: self.messages_sent(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            error_count: self.error_count(),
            pending_messages: self.pending_len(),
            tokens_remaining: self.throttle.tokens_remaining(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("origin_address", &self.origin_address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub display_name: String,
    pub origin_address: String,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error_count: u32,
    pub pending_messages: usize,
    pub tokens_remaining: u32,
}
