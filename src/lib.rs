// Shared components
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Admission control and connection lifecycle
pub mod circuit_breaker;
pub mod connection_manager;
pub mod ratelimit;
pub mod tasks;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
