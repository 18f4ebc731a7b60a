mod cleanup;
mod heartbeat;

pub use cleanup::CleanupTask;
pub use heartbeat::{HeartbeatRound, HeartbeatTask};
