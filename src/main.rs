use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use depot::{Config, Depot};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::parse());
    let (depot, manager) = Depot::new(config).await?;
    info!(items = depot.stored_count().await, "depot ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link = tokio::spawn(manager.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    link.await?;

    Ok(())
}
