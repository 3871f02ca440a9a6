//! Connection cache in front of the protocol clients.

use super::{connect_client, ClientError, Counters, DownloadClient, RawJob};
use crate::config::ClientConfig;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Hands out one connected client per client id and rebuilds it after a
/// connection or authentication failure.
#[derive(Default)]
pub struct ClientAdapter {
    cache: Mutex<HashMap<String, Arc<dyn DownloadClient>>>,
}

impl ClientAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, id: &str) -> Option<Arc<dyn DownloadClient>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    async fn handle(&self, config: &ClientConfig) -> Result<Arc<dyn DownloadClient>, ClientError> {
        if let Some(client) = self.cached(&config.id) {
            return Ok(client);
        }

        tracing::info!("ClientAdapter: connecting to '{}'", config.name);
        let client = connect_client(config).await?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.id.clone(), client.clone());
        Ok(client)
    }

    /// Drop the cached handle for one client.
    pub fn invalidate(&self, id: &str) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
    }

    /// Drop every cached handle.
    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn get_counters(&self, config: &ClientConfig) -> Result<Counters, ClientError> {
        let client = self.handle(config).await?;
        match client.get_counters().await {
            Err(e) if e.is_connection_error() => {
                tracing::warn!("ClientAdapter: lost connection to '{}' ({}), reconnecting", config.name, e);
                self.invalidate(&config.id);
                let client = self.handle(config).await?;
                client.get_counters().await.inspect_err(|e| self.evict_on(config, e))
            }
            other => other,
        }
    }

    pub async fn list_jobs(&self, config: &ClientConfig) -> Result<Vec<RawJob>, ClientError> {
        let client = self.handle(config).await?;
        match client.list_jobs().await {
            Err(e) if e.is_connection_error() => {
                tracing::warn!("ClientAdapter: lost connection to '{}' ({}), reconnecting", config.name, e);
                self.invalidate(&config.id);
                let client = self.handle(config).await?;
                client.list_jobs().await.inspect_err(|e| self.evict_on(config, e))
            }
            other => other,
        }
    }

    fn evict_on(&self, config: &ClientConfig, e: &ClientError) {
        if e.is_connection_error() {
            self.invalidate(&config.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{config, serve};
    use crate::config::ClientKind;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// qBittorrent stand-in whose sessions expire after `ttl` API calls.
    fn expiring_qbittorrent(logins: Arc<AtomicUsize>, ttl: usize) -> Router {
        let calls = Arc::new(AtomicUsize::new(0));
        Router::new()
            .route(
                "/api/v2/auth/login",
                post(move || {
                    let logins = logins.clone();
                    async move {
                        let n = logins.fetch_add(1, Ordering::SeqCst) + 1;
                        ([(header::SET_COOKIE, format!("SID=s{}; path=/", n))], "Ok.").into_response()
                    }
                }),
            )
            .route(
                "/api/v2/sync/maindata",
                get(move |headers: HeaderMap| {
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        let cookie = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()).unwrap_or("");
                        // Only the latest session is valid once the first has expired.
                        if n >= ttl && cookie.contains("SID=s1") {
                            return StatusCode::FORBIDDEN.into_response();
                        }
                        Json(json!({"server_state": {"alltime_ul": n}})).into_response()
                    }
                }),
            )
    }

    #[tokio::test]
    async fn test_handles_are_cached() {
        let logins = Arc::new(AtomicUsize::new(0));
        let addr = serve(expiring_qbittorrent(logins.clone(), usize::MAX)).await;
        let adapter = ClientAdapter::new();
        let cfg = config("q", ClientKind::Qbittorrent, addr.to_string());

        adapter.get_counters(&cfg).await.unwrap();
        adapter.get_counters(&cfg).await.unwrap();
        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.cached_count(), 1);

        adapter.clear();
        assert_eq!(adapter.cached_count(), 0);
        adapter.get_counters(&cfg).await.unwrap();
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_session_is_rebuilt_in_cycle() {
        let logins = Arc::new(AtomicUsize::new(0));
        let addr = serve(expiring_qbittorrent(logins.clone(), 1)).await;
        let adapter = ClientAdapter::new();
        let cfg = config("q", ClientKind::Qbittorrent, addr.to_string());

        adapter.get_counters(&cfg).await.unwrap();
        // The second call hits an expired session, re-authenticates and succeeds.
        let counters = adapter.get_counters(&cfg).await.unwrap();
        assert_eq!(counters.cumulative_uploaded, 2);
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_client_is_not_cached() {
        let adapter = ClientAdapter::new();
        let cfg = config("dead", ClientKind::Qbittorrent, "127.0.0.1:1".to_string());

        assert!(matches!(adapter.get_counters(&cfg).await, Err(ClientError::Unreachable(_))));
        assert_eq!(adapter.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_retry_evicts_handle() {
        let app = Router::new()
            .route("/api/stats/server", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let addr = serve(app).await;
        let mut cfg = config("r", ClientKind::Qbittorrent, "127.0.0.1:8080".to_string());
        cfg.use_proxy = true;
        cfg.proxy_port = addr.port();

        let adapter = ClientAdapter::new();
        assert!(adapter.get_counters(&cfg).await.is_err());
        assert_eq!(adapter.cached_count(), 0);
    }
}
