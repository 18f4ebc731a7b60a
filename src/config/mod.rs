mod settings;

pub use settings::{ConnectionConfig, OtelConfig, ServerConfig, Settings};
