//! Lifecycle events published to the chat layer

use uuid::Uuid;

/// Capacity of the event channel; slow subscribers skip events (lagged)
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Published after a state change has been committed to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        connection_id: Uuid,
        user_id: Option<String>,
        display_name: String,
    },
    Disconnected {
        connection_id: Uuid,
        user_id: Option<String>,
        reason: String,
    },
    MessageReceived {
        connection_id: Uuid,
        user_id: Option<String>,
        payload: String,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> Uuid {
        match self {
            Self::Connected { connection_id, .. }
            | Self::Disconnected { connection_id, .. }
            | Self::MessageReceived { connection_id, .. } => *connection_id,
        }
    }
}
