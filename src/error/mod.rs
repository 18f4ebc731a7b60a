use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Which admission ceiling rejected a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityScope {
    Total,
    PerIp,
    PerUser,
}

impl CapacityScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::PerIp => "per_ip",
            Self::PerUser => "per_user",
        }
    }
}

impl std::fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by connection admission and the send path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection limit exceeded ({scope}): {current}/{max}")]
    CapacityExceeded {
        scope: CapacityScope,
        current: usize,
        max: usize,
    },

    #[error("Rate limit exceeded for {identifier}")]
    RateLimitExceeded {
        identifier: String,
        connection_id: Option<Uuid>,
    },

    #[error("Operation timed out: {operation}")]
    Timeout {
        operation: &'static str,
        connection_id: Option<Uuid>,
    },

    #[error("Message too large for connection {connection_id}: {size} bytes (max {max})")]
    MessageTooLarge {
        connection_id: Uuid,
        size: usize,
        max: usize,
    },

    #[error("Outbound queue full for connection {connection_id} ({max} pending)")]
    QueueFull { connection_id: Uuid, max: usize },

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        connection_id: Option<Uuid>,
        reason: String,
    },
}

impl ConnectionError {
    pub fn failed(connection_id: Option<Uuid>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            connection_id,
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: &'static str, connection_id: Option<Uuid>) -> Self {
        Self::Timeout {
            operation,
            connection_id,
        }
    }

    /// Connection the error refers to, when one exists
    pub fn connection_id(&self) -> Option<Uuid> {
        match self {
            Self::RateLimitExceeded { connection_id, .. }
            | Self::Timeout { connection_id, .. }
            | Self::ConnectionFailed { connection_id, .. } => *connection_id,
            Self::MessageTooLarge { connection_id, .. } | Self::QueueFull { connection_id, .. } => {
                Some(*connection_id)
            }
            Self::CapacityExceeded { .. } | Self::CircuitOpen => None,
        }
    }

    /// Operational failures count against the circuit breaker; policy
    /// rejections (capacity, throttling, size, backpressure) do not.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionFailed { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }

    /// Stable label used for metrics and client-facing error codes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Timeout { .. } => "timeout",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::QueueFull { .. } => "queue_full",
            Self::CircuitOpen => "circuit_open",
            Self::ConnectionFailed { .. } => "connection_failed",
        }
    }
}

/// Service-level errors (startup and HTTP surface)
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = match &self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        };
        let log_message = self.to_string();
        let client_message = if is_production() {
            "Internal server error".to_string()
        } else {
            log_message.clone()
        };

        // Always log the detailed error server-side
        tracing::error!(code = %code, message = %log_message, "API error");

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_classification() {
        let id = Uuid::new_v4();
        assert!(ConnectionError::timeout("send", Some(id)).is_breaker_failure());
        assert!(ConnectionError::failed(Some(id), "transport closed").is_breaker_failure());

        assert!(!ConnectionError::CapacityExceeded {
            scope: CapacityScope::Total,
            current: 2,
            max: 2,
        }
        .is_breaker_failure());
        assert!(!ConnectionError::QueueFull {
            connection_id: id,
            max: 1
        }
        .is_breaker_failure());
        assert!(!ConnectionError::CircuitOpen.is_breaker_failure());
    }

    #[test]
    fn test_connection_id_extraction() {
        let id = Uuid::new_v4();
        let err = ConnectionError::MessageTooLarge {
            connection_id: id,
            size: 10,
            max: 5,
        };
        assert_eq!(err.connection_id(), Some(id));
        assert_eq!(ConnectionError::CircuitOpen.connection_id(), None);
        assert!(ConnectionError::CircuitOpen.is_circuit_open());
    }

    #[test]
    fn test_app_error_response_status() {
        let response = AppError::Internal("encoder failed".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_display_messages() {
        let err = ConnectionError::CapacityExceeded {
            scope: CapacityScope::PerIp,
            current: 1,
            max: 1,
        };
        assert_eq!(err.to_string(), "Connection limit exceeded (per_ip): 1/1");
        assert_eq!(err.kind(), "capacity_exceeded");
    }
}
