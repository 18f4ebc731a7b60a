use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Admission, throttling and lifecycle limits for real-time connections.
///
/// Every duration is expressed in whole seconds here; `ConnectionLimits`
/// converts them into `Duration`s.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Global admission ceiling
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Ceiling per origin address
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    /// Ceiling per user id (only applied when a user id is supplied)
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    /// Idle eviction threshold in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
    /// Liveness ping cadence in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Requests accepted per identifier inside one sliding window
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests_per_window: u32,
    /// Sliding window length in seconds
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_seconds: u64,
    /// How long an abusive identifier stays blocked, in seconds
    #[serde(default = "default_rate_limit_block")]
    pub rate_limit_block_seconds: u64,
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    /// Delay before an open circuit starts probing, in seconds
    #[serde(default = "default_recovery_timeout")]
    pub circuit_breaker_recovery_seconds: u64,
    /// Bound for every accept/send/close on a transport, in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: u64,
    /// Reaper tick in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Outbound payload cap in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Per-connection outbound queue cap
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,
    /// Overall bound for `ConnectionManager::stop`, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_connections_per_ip() -> usize {
    10
}

fn default_max_connections_per_user() -> usize {
    5
}

fn default_connection_timeout() -> u64 {
    300 // 5 minutes
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_rate_limit_requests() -> u32 {
    100
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_rate_limit_block() -> u64 {
    300 // 5 minutes
}

fn default_failure_threshold() -> u32 {
    10
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_send_timeout() -> u64 {
    5
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_max_message_bytes() -> usize {
    65536
}

fn default_max_pending_messages() -> usize {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "connection-gateway".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("connection.max_connections", default_max_connections() as u64)?
            .set_default(
                "connection.max_connections_per_ip",
                default_max_connections_per_ip() as u64,
            )?
            .set_default(
                "connection.max_connections_per_user",
                default_max_connections_per_user() as u64,
            )?
            .set_default(
                "connection.connection_timeout_seconds",
                default_connection_timeout(),
            )?
            .set_default(
                "connection.heartbeat_interval_seconds",
                default_heartbeat_interval(),
            )?
            .set_default(
                "connection.rate_limit_requests_per_window",
                default_rate_limit_requests(),
            )?
            .set_default(
                "connection.rate_limit_window_seconds",
                default_rate_limit_window(),
            )?
            .set_default("connection.rate_limit_block_seconds", default_rate_limit_block())?
            .set_default(
                "connection.circuit_breaker_failure_threshold",
                default_failure_threshold(),
            )?
            .set_default(
                "connection.circuit_breaker_recovery_seconds",
                default_recovery_timeout(),
            )?
            .set_default("connection.send_timeout_seconds", default_send_timeout())?
            .set_default("connection.cleanup_interval_seconds", default_cleanup_interval())?
            .set_default(
                "connection.max_message_bytes",
                default_max_message_bytes() as u64,
            )?
            .set_default(
                "connection.max_pending_messages",
                default_max_pending_messages() as u64,
            )?
            .set_default("connection.shutdown_timeout_seconds", default_shutdown_timeout())?
            .set_default("otel.enabled", false)?
            .set_default("otel.endpoint", default_otel_endpoint())?
            .set_default("otel.service_name", default_service_name())?
            .set_default("otel.sampling_ratio", default_sampling_ratio())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // GATEWAY__CONNECTION__MAX_CONNECTIONS, GATEWAY__SERVER__PORT, ...
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_connections_per_user: default_max_connections_per_user(),
            connection_timeout_seconds: default_connection_timeout(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            rate_limit_requests_per_window: default_rate_limit_requests(),
            rate_limit_window_seconds: default_rate_limit_window(),
            rate_limit_block_seconds: default_rate_limit_block(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_recovery_seconds: default_recovery_timeout(),
            send_timeout_seconds: default_send_timeout(),
            cleanup_interval_seconds: default_cleanup_interval(),
            max_message_bytes: default_max_message_bytes(),
            max_pending_messages: default_max_pending_messages(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
