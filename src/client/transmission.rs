//! Transmission RPC client.

use super::{http_client, parse_host, ClientError, Counters, DownloadClient, RawJob, Tracker, LIST_TIMEOUT, POLL_TIMEOUT};
use crate::config::ClientConfig;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const DEFAULT_PORT: u16 = 9091;
const SESSION_HEADER: &str = "X-Transmission-Session-Id";

const TORRENT_FIELDS: &[&str] = &[
    "id",
    "name",
    "hashString",
    "downloadDir",
    "totalSize",
    "status",
    "comment",
    "trackers",
    "percentDone",
    "uploadedEver",
];

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: String,
    arguments: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionStats {
    #[serde(default)]
    upload_speed: i64,
    #[serde(default)]
    download_speed: i64,
    #[serde(rename = "cumulative-stats", default)]
    cumulative_stats: CumulativeStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CumulativeStats {
    #[serde(default)]
    uploaded_bytes: i64,
    #[serde(default)]
    downloaded_bytes: i64,
}

#[derive(Debug, Deserialize)]
struct TorrentList {
    #[serde(default)]
    torrents: Vec<Torrent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Torrent {
    hash_string: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    download_dir: String,
    #[serde(default)]
    total_size: i64,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    trackers: Vec<TrackerStat>,
    #[serde(default)]
    percent_done: f64,
    #[serde(default)]
    uploaded_ever: i64,
}

#[derive(Debug, Deserialize)]
struct TrackerStat {
    #[serde(default)]
    announce: String,
}

/// Name of a numeric torrent status code.
pub fn status_name(code: i64) -> String {
    match code {
        0 => "stopped".to_string(),
        1 => "check pending".to_string(),
        2 => "checking".to_string(),
        3 => "download pending".to_string(),
        4 => "downloading".to_string(),
        5 => "seed pending".to_string(),
        6 => "seeding".to_string(),
        other => other.to_string(),
    }
}

/// Transmission client using the session-id handshake.
pub struct TransmissionClient {
    name: String,
    rpc_url: Url,
    username: String,
    password: String,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
}

impl TransmissionClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let host = parse_host(&config.host)?;
        let hostname = host.host_str().unwrap_or("localhost");
        let port = host.port().unwrap_or(DEFAULT_PORT);
        let rpc_url = Url::parse(&format!("{}://{}:{}/transmission/rpc", host.scheme(), hostname, port))
            .map_err(|e| ClientError::Unsupported(format!("{}: {}", config.name, e)))?;

        Ok(Self {
            name: config.name.clone(),
            rpc_url,
            username: config.username.clone(),
            password: config.password.clone(),
            http: http_client()?,
            session_id: Mutex::new(None),
        })
    }

    /// Obtain a session id and verify credentials.
    pub async fn handshake(&self) -> Result<(), ClientError> {
        self.rpc::<Value>("session-get", json!({}), POLL_TIMEOUT).await?;
        tracing::debug!("Transmission: session established with '{}'", self.name);
        Ok(())
    }

    fn current_session(&self) -> Option<String> {
        self.session_id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn rpc<T: DeserializeOwned>(&self, method: &str, arguments: Value, timeout: Duration) -> Result<T, ClientError> {
        let body = json!({ "method": method, "arguments": arguments });

        // The first request of a session is answered with 409 and the id to use.
        for _ in 0..2 {
            let mut request = self.http.post(self.rpc_url.clone()).timeout(timeout).json(&body);
            if !self.username.is_empty() {
                request = request.basic_auth(&self.username, Some(&self.password));
            }
            if let Some(id) = self.current_session() {
                request = request.header(SESSION_HEADER, id);
            }

            let response = request.send().await?;
            match response.status() {
                StatusCode::CONFLICT => {
                    let id = response
                        .headers()
                        .get(SESSION_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| ClientError::MalformedResponse(format!("{}: 409 without session id", self.name)))?;
                    *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
                    continue;
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(ClientError::Unauthorized(format!("{}: credentials rejected", self.name)));
                }
                _ => {}
            }

            let reply: RpcResponse<T> = response.error_for_status()?.json().await?;
            if reply.result != "success" {
                return Err(ClientError::MalformedResponse(format!("{}: {} failed: {}", self.name, method, reply.result)));
            }
            return reply
                .arguments
                .ok_or_else(|| ClientError::MalformedResponse(format!("{}: {} returned no arguments", self.name, method)));
        }

        Err(ClientError::Unauthorized(format!("{}: session id rejected", self.name)))
    }
}

#[async_trait]
impl DownloadClient for TransmissionClient {
    async fn get_counters(&self) -> Result<Counters, ClientError> {
        let stats: SessionStats = self.rpc("session-stats", json!({}), POLL_TIMEOUT).await?;
        Ok(Counters {
            upload_speed: stats.upload_speed,
            download_speed: stats.download_speed,
            cumulative_uploaded: stats.cumulative_stats.uploaded_bytes,
            cumulative_downloaded: stats.cumulative_stats.downloaded_bytes,
        })
    }

    async fn list_jobs(&self) -> Result<Vec<RawJob>, ClientError> {
        let list: TorrentList = self
            .rpc("torrent-get", json!({ "fields": TORRENT_FIELDS }), LIST_TIMEOUT)
            .await?;

        Ok(list
            .torrents
            .into_iter()
            .map(|t| RawJob {
                hash: t.hash_string,
                name: t.name,
                save_path: t.download_dir,
                size: t.total_size,
                progress: t.percent_done,
                state: status_name(t.status),
                comment: t.comment,
                trackers: t.trackers.into_iter().map(|tr| Tracker { url: tr.announce }).collect(),
                uploaded: t.uploaded_ever,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{config, serve};
    use crate::config::ClientKind;
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};

    fn fake_transmission() -> Router {
        Router::new().route(
            "/transmission/rpc",
            post(|headers: HeaderMap, Json(req): Json<Value>| async move {
                if headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) != Some("tok-1") {
                    return (HttpStatus::CONFLICT, [(SESSION_HEADER, "tok-1")], "").into_response();
                }
                let arguments = match req["method"].as_str() {
                    Some("session-get") => json!({ "version": "4.0.5" }),
                    Some("session-stats") => json!({
                        "uploadSpeed": 300,
                        "downloadSpeed": 100,
                        "cumulative-stats": { "uploadedBytes": 7000, "downloadedBytes": 3000 }
                    }),
                    Some("torrent-get") => {
                        assert!(req["arguments"]["fields"].as_array().unwrap().len() >= 10);
                        json!({ "torrents": [{
                            "id": 1, "name": "Album-GrpB", "hashString": "ccc",
                            "downloadDir": "/music", "totalSize": 55, "status": 6,
                            "comment": "", "percentDone": 1.0, "uploadedEver": 9,
                            "trackers": [{ "announce": "https://tracker.example.com/a", "id": 0, "tier": 0 }]
                        }]})
                    }
                    _ => return Json(json!({ "result": "method name not recognized" })).into_response(),
                };
                Json(json!({ "result": "success", "arguments": arguments })).into_response()
            }),
        )
    }

    #[tokio::test]
    async fn test_session_handshake_and_counters() {
        let addr = serve(fake_transmission()).await;
        let client = TransmissionClient::new(&config("t", ClientKind::Transmission, addr.to_string())).unwrap();

        client.handshake().await.unwrap();
        assert_eq!(client.current_session().as_deref(), Some("tok-1"));

        let counters = client.get_counters().await.unwrap();
        assert_eq!(counters.upload_speed, 300);
        assert_eq!(counters.cumulative_uploaded, 7000);
        assert_eq!(counters.cumulative_downloaded, 3000);
    }

    #[tokio::test]
    async fn test_list_jobs() {
        let addr = serve(fake_transmission()).await;
        let client = TransmissionClient::new(&config("t", ClientKind::Transmission, addr.to_string())).unwrap();

        let jobs = client.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].hash, "ccc");
        assert_eq!(jobs[0].state, "seeding");
        assert_eq!(jobs[0].save_path, "/music");
        assert_eq!(jobs[0].trackers[0].url, "https://tracker.example.com/a");
    }

    #[tokio::test]
    async fn test_rpc_failure_is_malformed() {
        let addr = serve(fake_transmission()).await;
        let client = TransmissionClient::new(&config("t", ClientKind::Transmission, addr.to_string())).unwrap();
        let result = client.rpc::<Value>("bogus", json!({}), POLL_TIMEOUT).await;
        assert!(matches!(result, Err(ClientError::MalformedResponse(_))));
    }

    #[test]
    fn test_default_port() {
        let client = TransmissionClient::new(&config("t", ClientKind::Transmission, "nas.local".to_string())).unwrap();
        assert_eq!(client.rpc_url.as_str(), "http://nas.local:9091/transmission/rpc");
    }

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(0), "stopped");
        assert_eq!(status_name(4), "downloading");
        assert_eq!(status_name(6), "seeding");
        assert_eq!(status_name(42), "42");
    }
}
