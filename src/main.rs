//! getfiled: serves files over the GET/QUIT transfer protocol
//!
//! Features:
//! - Dual-stack listener (IPv6 with IPv4-mapped peers)
//! - One task per connection, reaped on completion
//! - Idle read deadline per connection
//! - Kernel-assisted file streaming on Linux
//! - Configuration via CLI arguments or TOML file

use getfile::config::ServerConfig;
use getfile::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        pid = std::process::id(),
        host = ?config.host,
        port = config.port,
        root = %config.root.display(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        max_connections = config.max_connections,
        "Starting getfiled"
    );

    Server::new(config).run().await
}
