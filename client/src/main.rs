use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod cache;
mod config;
mod dispatcher;
mod forwarder;
mod pool;
mod session;
#[cfg(test)]
mod testutil;

use config::ClientConfig;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(author = "Burrow Team")]
#[command(version = "0.1.0")]
#[command(about = "Expose a local HTTP service through a reverse WebSocket tunnel", long_about = None)]
struct Cli {
    /// Path to burrow.yml (standard locations searched when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tunnel server URL override
    #[arg(short, long)]
    server: Option<String>,

    /// Local origin base URL override
    #[arg(short, long)]
    local: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let mut config = match cli.config.or_else(ClientConfig::find_config) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ClientConfig::load(&path)?
        }
        None => ClientConfig::default(),
    };
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(local) = cli.local {
        config.local_server.url = local;
    }
    config.validate()?;

    let pools = Arc::new(pool::Pools::from_config(&config.pools));
    let cache = Arc::new(cache::CorrelationCache::new());
    let forwarder = Arc::new(forwarder::HttpForwarder::new(&config.local_server)?);
    let dispatcher = Arc::new(dispatcher::EventDispatcher::new(cache, forwarder, pools.clone()));

    info!("Exposing {} through {}", config.local_server.url, config.server);

    // Session establishment and reconnection run on the registration pool
    let server_url = config.server.clone();
    pools.registration.spawn(async move {
        loop {
            match session::run_session(&server_url, dispatcher.clone()).await {
                Ok(()) => {
                    info!("Session closed gracefully");
                    break;
                }
                Err(err) => {
                    error!("Tunnel error: {}. Reconnecting in 5s...", err);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
    });
    pools.registration.close_and_wait().await;

    pools.shutdown().await;
    Ok(())
}
