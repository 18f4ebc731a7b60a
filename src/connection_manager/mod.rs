//! Connection admission, registry and lifecycle.
//!
//! `ConnectionManager` is the entry point; the registry, broadcaster and
//! connection types are exposed for the background tasks and for tests.

mod broadcaster;
mod events;
mod manager;
mod registry;
mod stats;
mod types;

pub use broadcaster::{serialize_payload, BroadcastOutcome, Broadcaster, SendFailureHandler};
pub use events::{ConnectionEvent, EVENT_CHANNEL_CAPACITY};
pub use manager::ConnectionManager;
pub use registry::{ConnectionRegistry, RegistryCapacity};
pub use stats::{ManagerCounters, ManagerMetrics, RegistryStats};
pub use types::{
    Connection, ConnectionInfo, ConnectionLimits, ConnectionState, DisconnectReason,
    MAX_CONNECTION_ERRORS,
};
