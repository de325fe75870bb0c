//! grow-a-hub: a real-time RPC hub server
//!
//! Clients connect over TCP, complete a JSON handshake and then invoke hub
//! methods. The hub can push invocations back to any connection, to named
//! groups of connections or to everyone.
//!
//! Features:
//! - JSON hub protocol with record-separator framing
//! - Groups with atomic join/leave and fan-out
//! - Keep-alive pings and idle connection timeouts
//! - Configuration via CLI arguments or TOML file

use grow_a_hub::config::Config;
use grow_a_hub::methods;
use grow_a_hub::runtime::Hub;
use grow_a_hub::server::Server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        max_message_size = config.max_message_size,
        keepalive_secs = config.keepalive_interval.as_secs(),
        client_timeout_secs = config.client_timeout.as_secs(),
        "Starting grow-a-hub server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let hub = methods::register(Hub::builder(config.hub_config())).build()?;
    info!(methods = ?hub.dispatcher().methods(), "Hub ready");
    let server = Server::new(hub, &config);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    server.run(shutdown).await?;
    info!("Server stopped");
    Ok(())
}
