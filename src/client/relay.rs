//! Client reached through the HTTP relay.
//!
//! The relay runs on the machine hosting the download client and forwards
//! to it over the loopback interface, so requests name `127.0.0.1` as the
//! target and only the relay's own port is exposed.

use super::qbittorrent::{is_announce_url, ServerState};
use super::{http_client, parse_host, ClientError, Counters, DownloadClient, RawJob, Tracker, LIST_TIMEOUT, POLL_TIMEOUT};
use crate::config::ClientConfig;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_CLIENT_PORT: u16 = 8080;

/// Downloader descriptor the relay expects.
#[derive(Debug, Clone, Serialize)]
struct RelayTarget {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    host: String,
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TorrentsRequest<'a> {
    downloaders: &'a [RelayTarget],
    include_comment: bool,
    include_trackers: bool,
}

/// Stats reply; older relays nest qBittorrent's `server_state`, newer ones
/// flatten the totals to the root.
#[derive(Debug, Deserialize)]
struct RelayStats {
    server_state: Option<ServerState>,
    #[serde(default)]
    upload_speed: i64,
    #[serde(default)]
    download_speed: i64,
    #[serde(default)]
    total_upload: i64,
    #[serde(default)]
    total_download: i64,
}

impl From<RelayStats> for Counters {
    fn from(s: RelayStats) -> Self {
        match s.server_state {
            Some(state) => state.into(),
            None => Counters {
                upload_speed: s.upload_speed,
                download_speed: s.download_speed,
                cumulative_uploaded: s.total_upload,
                cumulative_downloaded: s.total_download,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RelayTorrent {
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    save_path: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    trackers: Vec<Tracker>,
    /// Some relay versions send a single tracker instead of a list.
    #[serde(default)]
    tracker: String,
    #[serde(default)]
    uploaded: i64,
}

impl From<RelayTorrent> for RawJob {
    fn from(t: RelayTorrent) -> Self {
        let trackers = if !t.trackers.is_empty() {
            t.trackers.into_iter().filter(|tr| is_announce_url(&tr.url)).collect()
        } else if !t.tracker.is_empty() {
            vec![Tracker { url: t.tracker }]
        } else {
            Vec::new()
        };

        RawJob {
            hash: t.hash,
            name: t.name,
            save_path: t.save_path,
            size: t.size,
            progress: t.progress,
            state: t.state,
            comment: t.comment,
            trackers,
            uploaded: t.uploaded,
        }
    }
}

/// Stateless relay client; every call carries the credentials.
pub struct RelayClient {
    name: String,
    base: String,
    target: RelayTarget,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let host = parse_host(&config.host)?;
        let relay_host = host.host_str().unwrap_or("localhost");

        Ok(Self {
            name: config.name.clone(),
            base: format!("http://{}:{}", relay_host, config.proxy_port),
            target: RelayTarget {
                id: config.id.clone(),
                kind: config.kind.as_str().to_string(),
                host: format!("http://127.0.0.1:{}", host.port().unwrap_or(DEFAULT_CLIENT_PORT)),
                username: config.username.clone(),
                password: config.password.clone(),
            },
            http: http_client()?,
        })
    }
}

#[async_trait]
impl DownloadClient for RelayClient {
    async fn get_counters(&self) -> Result<Counters, ClientError> {
        let stats: Vec<RelayStats> = self
            .http
            .post(format!("{}/api/stats/server", self.base))
            .json(&[&self.target])
            .timeout(POLL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        stats
            .into_iter()
            .next()
            .map(Counters::from)
            .ok_or_else(|| ClientError::MalformedResponse(format!("relay returned no stats for '{}'", self.name)))
    }

    async fn list_jobs(&self) -> Result<Vec<RawJob>, ClientError> {
        let request = TorrentsRequest {
            downloaders: std::slice::from_ref(&self.target),
            include_comment: true,
            include_trackers: true,
        };

        let torrents: Vec<RelayTorrent> = self
            .http
            .post(format!("{}/api/torrents/all", self.base))
            .json(&request)
            .timeout(LIST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(torrents.into_iter().map(RawJob::from).collect())
    }
}
