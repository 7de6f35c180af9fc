//! session-stream server binary.
//!
//! Starts one listener per configured port and serves the built-in
//! protocols until interrupted. Configuration via CLI arguments or a TOML
//! file.

use session_stream::config::Config;
use session_stream::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        listeners = config.listeners.len(),
        max_connections = config.max_connections,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Starting session-stream server"
    );

    let server = Server::from_config(&config)?;
    server.run().await?;
    Ok(())
}
