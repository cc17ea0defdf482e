//! Multi-user TCP Chat Server - Entry Point
//!
//! Parses configuration, binds the listener and runs until Ctrl-C.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use messenger::{ChatListener, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=messenger=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("messenger=info")),
        )
        .init();

    let config = ServerConfig::parse();
    let protocol = config.protocol;

    let listener = ChatListener::bind(config).await?;
    info!(
        "Chat server listening on {} (protocols: {:?})",
        listener.local_addr()?,
        protocol
    );

    let shutdown = listener.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    listener.run().await?;
    info!("Server stopped");
    Ok(())
}
