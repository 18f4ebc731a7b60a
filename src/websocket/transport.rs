//! Transport abstraction handed to the connection manager per inbound socket

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{CapacityScope, ConnectionError};

/// WebSocket close code sent with a close frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);
    pub const TRY_AGAIN_LATER: CloseCode = CloseCode(1013);
    pub const SERVER_AT_CAPACITY: CloseCode = CloseCode(4001);
    pub const IP_LIMIT_REACHED: CloseCode = CloseCode(4002);
    pub const USER_LIMIT_REACHED: CloseCode = CloseCode(4003);
    pub const RATE_LIMITED: CloseCode = CloseCode(4029);

    /// Close code used when admission is refused with `error`
    pub fn for_rejection(error: &ConnectionError) -> CloseCode {
        match error {
            ConnectionError::CapacityExceeded { scope, .. } => match scope {
                CapacityScope::Total => Self::SERVER_AT_CAPACITY,
                CapacityScope::PerIp => Self::IP_LIMIT_REACHED,
                CapacityScope::PerUser => Self::USER_LIMIT_REACHED,
            },
            ConnectionError::RateLimitExceeded { .. } => Self::RATE_LIMITED,
            ConnectionError::CircuitOpen => Self::TRY_AGAIN_LATER,
            _ => Self::INTERNAL_ERROR,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already closed")]
    Closed,
    #[error("transport error: {0}")]
    Protocol(String),
}

/// One peer's socket as seen by the manager.
///
/// Implementations do not apply timeouts themselves; every call site wraps
/// these in `tokio::time::timeout`.
#[async_trait]
pub trait Transport: Send {
    /// Complete the transport-level handshake
    async fn accept(&mut self) -> Result<(), TransportError>;

    async fn send_text(&mut self, payload: &str) -> Result<(), TransportError>;

    /// Send a close frame and shut the socket down
    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), TransportError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport for unit tests

    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MockState {
        pub accepted: bool,
        pub sent: Vec<String>,
        pub closed: Option<(CloseCode, String)>,
        pub fail_sends: bool,
        pub fail_accept: bool,
        pub accept_delay: Option<Duration>,
        pub send_delay: Option<Duration>,
    }

    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            let transport = Self::new();
            transport.state.lock().fail_sends = true;
            transport
        }

        pub fn stalling(delay: Duration) -> Self {
            let transport = Self::new();
            transport.state.lock().send_delay = Some(delay);
            transport
        }

        pub fn boxed(&self) -> Box<dyn Transport> {
            Box::new(self.clone())
        }

        pub fn sent(&self) -> Vec<String> {
            self.state.lock().sent.clone()
        }

        pub fn close_code(&self) -> Option<CloseCode> {
            self.state.lock().closed.as_ref().map(|(code, _)| *code)
        }

        pub fn set_fail_sends(&self, fail: bool) {
            self.state.lock().fail_sends = fail;
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn accept(&mut self) -> Result<(), TransportError> {
            let delay = self.state.lock().accept_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state.lock();
            if state.fail_accept {
                return Err(TransportError::Protocol("handshake refused".into()));
            }
            state.accepted = true;
            Ok(())
        }

        async fn send_text(&mut self, payload: &str) -> Result<(), TransportError> {
            let delay = self.state.lock().send_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return Err(TransportError::Closed);
            }
            if state.fail_sends {
                return Err(TransportError::Protocol("broken pipe".into()));
            }
            state.sent.push(payload.to_string());
            Ok(())
        }

        async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
            self.state.lock().closed = Some((code, reason.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_close_codes_are_distinct() {
        let total = CloseCode::for_rejection(&ConnectionError::CapacityExceeded {
            scope: CapacityScope::Total,
            current: 1,
            max: 1,
        });
        let ip = CloseCode::for_rejection(&ConnectionError::CapacityExceeded {
            scope: CapacityScope::PerIp,
            current: 1,
            max: 1,
        });
        let user = CloseCode::for_rejection(&ConnectionError::CapacityExceeded {
            scope: CapacityScope::PerUser,
            current: 1,
            max: 1,
        });
        let rate = CloseCode::for_rejection(&ConnectionError::RateLimitExceeded {
            identifier: "10.0.0.1".into(),
            connection_id: None,
        });

        assert_eq!(total, CloseCode::SERVER_AT_CAPACITY);
        assert_eq!(ip, CloseCode::IP_LIMIT_REACHED);
        assert_eq!(user, CloseCode::USER_LIMIT_REACHED);
        assert_eq!(rate, CloseCode::RATE_LIMITED);
    }
}
