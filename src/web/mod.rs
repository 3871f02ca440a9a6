//! Read-only HTTP API over the stored traffic, jobs and live speeds.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::SampleBuffer;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub buffer: Arc<SampleBuffer>,
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/api/health", get(handlers::handle_health))
        .route("/api/speeds/recent", get(handlers::handle_recent_speeds))
        .route("/api/speeds/latest", get(handlers::handle_latest_speeds))
        .route("/api/traffic", get(handlers::handle_traffic))
        .route("/api/traffic/daily", get(handlers::handle_daily_traffic))
        .route("/api/clients", get(handlers::handle_clients))
        .route("/api/jobs", get(handlers::handle_jobs))
        .route("/api/jobs/{hash}", get(handlers::handle_job))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Web server for the read API.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(config: &ServerConfig, store: Arc<dyn Store>, buffer: Arc<SampleBuffer>) -> Self {
        Self {
            port: config.http_port,
            state: AppState { store, buffer },
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web server listening on {}", addr);

        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
