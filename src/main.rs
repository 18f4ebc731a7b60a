use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;

use connection_gateway::config::Settings;
use connection_gateway::server::{create_app, AppState};
use connection_gateway::shutdown::shutdown_signal;
use connection_gateway::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing (kept alive until main returns)
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Create application state and start the heartbeat/cleanup loops
    let state = AppState::new(settings.clone());
    let connection_manager = state.connection_manager.clone();
    connection_manager.start();

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Stop accepting upgrades on Ctrl+C / SIGTERM
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Close every live connection
    let result = connection_manager.stop().await;
    if !result.is_clean() {
        tracing::warn!(
            forced_cleared = result.forced_cleared,
            "Some connections were dropped without a close frame"
        );
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}
