//! Ephemeral Chat Room Server - Entry Point
//!
//! Starts the TCP listener and RoomEngine actor, accepting connections.

use std::env;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hush_server::{handle_connection, EngineConfig, RoomEngine};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:3000";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=hush_server=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hush_server=info")),
        )
        .init();

    // Bind address: first argument, then HUSH_ADDR, then default
    let addr = env::args()
        .nth(1)
        .or_else(|| env::var("HUSH_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let config = EngineConfig::from_env();
    info!(
        "Default timer {}s, typing timeout {:?}, close grace {:?}",
        config.default_ttl, config.typing_timeout, config.close_grace
    );

    let listener = TcpListener::bind(&addr).await?;
    info!("Ephemeral chat server listening on {}", addr);

    let engine = RoomEngine::spawn(config);

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("New connection from {}", peer);
                let engine = engine.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, engine).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
