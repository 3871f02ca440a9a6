//! Client adapter module.
//!
//! Supports qBittorrent and Transmission over their native web APIs, and
//! qBittorrent through the HTTP relay that runs next to a remote client.

mod adapter;
mod qbittorrent;
mod relay;
mod transmission;

pub use adapter::*;
pub use qbittorrent::*;
pub use relay::*;
pub use transmission::*;

use crate::config::{ClientConfig, ClientKind};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Bound on live counter polls.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on full job listings.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(120);

/// Client error types.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unsupported client: {0}")]
    Unsupported(String),
}

impl ClientError {
    /// Whether the cached handle is suspect and should be rebuilt.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ClientError::Unreachable(_) | ClientError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => {
                ClientError::Unauthorized(e.to_string())
            }
            _ if e.is_decode() => ClientError::MalformedResponse(e.to_string()),
            _ => ClientError::Unreachable(e.to_string()),
        }
    }
}

/// One instantaneous traffic reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub upload_speed: i64,
    pub download_speed: i64,
    pub cumulative_uploaded: i64,
    pub cumulative_downloaded: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    #[serde(default)]
    pub url: String,
}

/// A job as listed by a client, with field names unified across protocols.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawJob {
    pub hash: String,
    pub name: String,
    pub save_path: String,
    pub size: i64,
    /// Completion ratio in `[0, 1]`.
    pub progress: f64,
    /// Client lifecycle state, unnormalised.
    pub state: String,
    pub comment: String,
    pub trackers: Vec<Tracker>,
    pub uploaded: i64,
}

/// Capability surface shared by every client protocol.
#[async_trait]
pub trait DownloadClient: Send + Sync {
    async fn get_counters(&self) -> Result<Counters, ClientError>;

    async fn list_jobs(&self) -> Result<Vec<RawJob>, ClientError>;
}

/// Build a client for `config` and complete its login handshake.
pub async fn connect_client(config: &ClientConfig) -> Result<Arc<dyn DownloadClient>, ClientError> {
    if config.uses_relay() {
        return Ok(Arc::new(RelayClient::new(config)?));
    }

    match config.kind {
        ClientKind::Qbittorrent => {
            let client = QbittorrentClient::new(config)?;
            client.login().await?;
            Ok(Arc::new(client))
        }
        ClientKind::Transmission => {
            let client = TransmissionClient::new(config)?;
            client.handshake().await?;
            Ok(Arc::new(client))
        }
        ClientKind::Unknown => Err(ClientError::Unsupported(format!(
            "'{}' has an unknown client type",
            config.name
        ))),
    }
}

/// Parse a configured host, which may omit the scheme and port.
pub(crate) fn parse_host(host: &str) -> Result<Url, ClientError> {
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| ClientError::Unsupported(format!("invalid host {:?}: {}", host, e)))?;
    if url.host_str().is_none() {
        return Err(ClientError::Unsupported(format!("invalid host {:?}", host)));
    }
    Ok(url)
}

pub(crate) fn http_client() -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .cookie_store(true)
        .timeout(LIST_TIMEOUT)
        .build()
        .map_err(|e| ClientError::Unsupported(e.to_string()))
}
