//! Metrics gateway server binary
//!
//! Boots the shared storage, background services, and the HTTP API, then
//! serves until interrupted.

mod handlers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use metricz_gateway::config::Config;
use metricz_gateway::poller::PollerManager;
use metricz_gateway::services::ServiceManager;
use metricz_gateway::storage::{StagingGc, Storage};

use handlers::{build_router, AppState};

/// Metrics aggregation gateway for game-server instances
#[derive(Parser, Debug)]
#[command(name = "metricz-gateway", version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(long)]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;
    if let Some(addr) = args.listen_addr {
        cfg.listen_addr = addr;
    }

    info!(
        path = %args.config.display(),
        servers_count = cfg.servers.len(),
        "Configuration loaded"
    );

    let storage = Arc::new(Storage::new(cfg.ingest.max_staging_size));
    let services = ServiceManager::new();

    services.spawn(Arc::new(StagingGc::new(
        storage.clone(),
        cfg.ingest.gc_interval(),
    )));

    let pollers = PollerManager::new(storage.clone(), cfg.servers.clone());
    pollers.start(&services);

    let state = Arc::new(AppState::new(storage, &cfg));
    let router = build_router(state, cfg.ingest.max_body_size);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    info!(addr = %cfg.listen_addr, "Gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background services");
    tokio::time::timeout(Duration::from_secs(10), services.shutdown())
        .await
        .unwrap_or_else(|_| tracing::warn!("Background services did not stop in time"));

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
