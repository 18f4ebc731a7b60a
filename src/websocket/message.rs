use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection_manager::ConnectionLimits;

/// Control messages a client may send; anything else is forwarded to the
/// chat layer untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
}

/// Limits advertised to the client in the welcome payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiatedLimits {
    pub max_message_bytes: usize,
    pub max_pending_messages: usize,
    pub rate_limit_requests_per_window: u32,
    pub rate_limit_window_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub connection_timeout_seconds: u64,
}

impl From<&ConnectionLimits> for NegotiatedLimits {
    fn from(limits: &ConnectionLimits) -> Self {
        Self {
            max_message_bytes: limits.max_message_size,
            max_pending_messages: limits.max_pending_messages,
            rate_limit_requests_per_window: limits.rate_limit_requests,
            rate_limit_window_seconds: limits.rate_limit_window.as_secs(),
            heartbeat_interval_seconds: limits.heartbeat_interval.as_secs(),
            connection_timeout_seconds: limits.connection_timeout.as_secs(),
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome {
        connection_id: Uuid,
        server_time: DateTime<Utc>,
        limits: NegotiatedLimits,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat {
        timestamp: DateTime<Utc>,
        status: String,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn welcome(connection_id: Uuid, limits: &ConnectionLimits) -> Self {
        Self::Welcome {
            connection_id,
            server_time: Utc::now(),
            limits: limits.into(),
        }
    }

    pub fn heartbeat(status: impl Into<String>) -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
            status: status.into(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
