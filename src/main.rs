//! Hyperliquid WebSocket gateway
//!
//! Serves downstream WebSocket sessions from either the upstream feed or the
//! local node's action log, depending on configuration.

use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hl_ws_gateway::server::{self, AppState};
use hl_ws_gateway::{Config, Gateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Hyperliquid WebSocket gateway");

    let config = Config::load()?;
    info!(
        source = ?config.source,
        listen_addr = %config.listen_addr,
        "Configuration loaded"
    );

    let gateway = Gateway::start(&config).await?;
    let app = server::router(AppState::new(&gateway, &config));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for WebSocket clients on /ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    gateway.shutdown().await;
    Ok(())
}
