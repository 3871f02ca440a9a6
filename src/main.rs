//! SeedWatch - download client telemetry engine
//!
//! Polls qBittorrent and Transmission clients for traffic counters, keeps a
//! job inventory attributed to sites and release groups, and serves the
//! history over a small read-only API.

mod client;
mod config;
mod db;
mod directory;
mod scheduler;
mod web;

use config::{ConfigSource, JsonFileConfig, ServerConfig};
use scheduler::{SampleBuffer, Scheduler};
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for the scheduler's final flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("seedwatch=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting SeedWatch on port {}...", cfg.http_port);
    tracing::info!("Reading clients from {}", cfg.config_path.display());

    let store = db::open_store(&cfg.database_url).await?;
    tracing::info!("Database ({}) initialized successfully", store.dialect());

    let source = Arc::new(JsonFileConfig::new(&cfg.config_path));
    let engine = match source.load() {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to load {}: {}; starting with no clients", cfg.config_path.display(), e);
            Default::default()
        }
    };
    if engine.enabled_clients().next().is_none() {
        tracing::warn!("No enabled download clients configured");
    }

    let buffer = Arc::new(SampleBuffer::for_poll_interval(engine.poll_interval()));
    let scheduler = Scheduler::new(store.clone(), source, engine, buffer.clone()).start();

    let server = Server::new(&cfg, store, buffer);
    let served = server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await;

    scheduler.stop();
    if !scheduler.join(SHUTDOWN_GRACE).await {
        tracing::warn!("Scheduler did not finish cleanly; some samples may be lost");
    }

    served
}
