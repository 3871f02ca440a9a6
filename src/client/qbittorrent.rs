//! qBittorrent Web API client.

use super::{http_client, parse_host, ClientError, Counters, DownloadClient, RawJob, Tracker, LIST_TIMEOUT, POLL_TIMEOUT};
use crate::config::ClientConfig;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

/// `server_state` block of `/api/v2/sync/maindata`; the relay returns the same shape.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ServerState {
    #[serde(default)]
    dl_info_speed: i64,
    #[serde(default)]
    up_info_speed: i64,
    #[serde(default)]
    alltime_dl: i64,
    #[serde(default)]
    alltime_ul: i64,
}

impl From<ServerState> for Counters {
    fn from(s: ServerState) -> Self {
        Counters {
            upload_speed: s.up_info_speed,
            download_speed: s.dl_info_speed,
            cumulative_uploaded: s.alltime_ul,
            cumulative_downloaded: s.alltime_dl,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MainData {
    #[serde(default)]
    server_state: ServerState,
}

#[derive(Debug, Deserialize)]
struct TorrentInfo {
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
    tracker: String,
    #[serde(default)]
    uploaded: i64,
}

#[derive(Debug, Deserialize)]
struct Properties {
    #[serde(default)]
    comment: String,
}

/// Whether a tracker URL is a real announce endpoint rather than a
/// pseudo-entry such as `** [DHT] **`.
pub(crate) fn is_announce_url(url: &str) -> bool {
    url.starts_with("http") || url.starts_with("udp")
}

/// qBittorrent client authenticated with a session cookie.
pub struct QbittorrentClient {
    name: String,
    base: Url,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl QbittorrentClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            name: config.name.clone(),
            base: parse_host(&config.host)?,
            username: config.username.clone(),
            password: config.password.clone(),
            http: http_client()?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        let base = self.base.as_str().trim_end_matches('/');
        Url::parse(&format!("{}{}", base, path))
            .map_err(|e| ClientError::Unsupported(format!("{}: {}", self.name, e)))
    }

    /// Log in and keep the `SID` cookie for later calls.
    pub async fn login(&self) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint("/api/v2/auth/login")?)
            .header(reqwest::header::REFERER, self.base.as_str())
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;

        if response.status() == StatusCode::FORBIDDEN {
            return Err(ClientError::Unauthorized(format!("{}: login refused", self.name)));
        }
        let body = response.error_for_status()?.text().await?;
        if body.trim() != "Ok." {
            return Err(ClientError::Unauthorized(format!("{}: bad credentials", self.name)));
        }

        tracing::debug!("qBittorrent: logged in to '{}'", self.name);
        Ok(())
    }

    async fn torrent_trackers(&self, hash: &str) -> Result<Vec<Tracker>, ClientError> {
        let trackers: Vec<Tracker> = self
            .http
            .get(self.endpoint("/api/v2/torrents/trackers")?)
            .query(&[("hash", hash)])
            .timeout(POLL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(trackers.into_iter().filter(|t| is_announce_url(&t.url)).collect())
    }

    async fn torrent_comment(&self, hash: &str) -> Result<String, ClientError> {
        let props: Properties = self
            .http
            .get(self.endpoint("/api/v2/torrents/properties")?)
            .query(&[("hash", hash)])
            .timeout(POLL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(props.comment)
    }
}

#[async_trait]
impl DownloadClient for QbittorrentClient {
    async fn get_counters(&self) -> Result<Counters, ClientError> {
        let data: MainData = self
            .http
            .get(self.endpoint("/api/v2/sync/maindata")?)
            .timeout(POLL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(data.server_state.into())
    }

    async fn list_jobs(&self) -> Result<Vec<RawJob>, ClientError> {
        let torrents: Vec<TorrentInfo> = self
            .http
            .get(self.endpoint("/api/v2/torrents/info")?)
            .query(&[("filter", "all")])
            .timeout(LIST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut jobs = Vec::with_capacity(torrents.len());
        for t in torrents {
            // Older versions leave `tracker` empty until a tracker has been
            // contacted and do not include the comment in the listing.
            let trackers = if t.tracker.is_empty() {
                self.torrent_trackers(&t.hash).await.unwrap_or_else(|e| {
                    tracing::debug!("qBittorrent: no trackers for {} on '{}': {}", t.hash, self.name, e);
                    Vec::new()
                })
            } else {
                vec![Tracker { url: t.tracker }]
            };

            let comment = if t.comment.is_empty() {
                self.torrent_comment(&t.hash).await.unwrap_or_else(|e| {
                    tracing::debug!("qBittorrent: no comment for {} on '{}': {}", t.hash, self.name, e);
                    String::new()
                })
            } else {
                t.comment
            };

            jobs.push(RawJob {
                hash: t.hash,
                name: t.name,
                save_path: t.save_path,
                size: t.size,
                progress: t.progress,
                state: t.state,
                comment,
                trackers,
                uploaded: t.uploaded,
            });
        }

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{config, serve};
    use crate::config::ClientKind;
    use axum::extract::Query;
    use axum::http::{header, HeaderMap, StatusCode as HttpStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    fn has_session(headers: &HeaderMap) -> bool {
        headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("SID=s3ss10n"))
            .unwrap_or(false)
    }

    fn fake_qbittorrent() -> Router {
        Router::new()
            .route(
                "/api/v2/auth/login",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    if form.get("password").map(String::as_str) == Some("secret") {
                        ([(header::SET_COOKIE, "SID=s3ss10n; path=/")], "Ok.").into_response()
                    } else {
                        "Fails.".into_response()
                    }
                }),
            )
            .route(
                "/api/v2/sync/maindata",
                get(|headers: HeaderMap| async move {
                    if !has_session(&headers) {
                        return HttpStatus::FORBIDDEN.into_response();
                    }
                    Json(json!({
                        "rid": 1,
                        "server_state": {
                            "dl_info_speed": 2048,
                            "up_info_speed": 1024,
                            "alltime_dl": 500000,
                            "alltime_ul": 900000
                        }
                    }))
                    .into_response()
                }),
            )
            .route(
                "/api/v2/torrents/info",
                get(|headers: HeaderMap| async move {
                    if !has_session(&headers) {
                        return HttpStatus::FORBIDDEN.into_response();
                    }
                    Json(json!([
                        {
                            "hash": "aaa", "name": "Show.S01.1080p-GrpA", "save_path": "/data",
                            "size": 100, "progress": 1.0, "state": "stalledUP",
                            "comment": "https://example.com/details.php?id=7",
                            "tracker": "https://tracker.example.com/announce", "uploaded": 42
                        },
                        {
                            "hash": "bbb", "name": "Movie", "save_path": "/data",
                            "size": 200, "progress": 0.5, "state": "downloading",
                            "tracker": "", "uploaded": 0
                        }
                    ]))
                    .into_response()
                }),
            )
            .route(
                "/api/v2/torrents/trackers",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("hash").map(String::as_str), Some("bbb"));
                    Json(json!([
                        {"url": "** [DHT] **", "status": 0},
                        {"url": "** [PeX] **", "status": 0},
                        {"url": "udp://tracker.other.org:1337/announce", "status": 2}
                    ]))
                }),
            )
            .route(
                "/api/v2/torrents/properties",
                get(|| async { Json(json!({"comment": "12345"})) }),
            )
    }

    #[tokio::test]
    async fn test_login_and_counters() {
        let addr = serve(fake_qbittorrent()).await;
        let client = QbittorrentClient::new(&config("q", ClientKind::Qbittorrent, addr.to_string())).unwrap();

        // Without a session the API refuses.
        assert!(matches!(client.get_counters().await, Err(ClientError::Unauthorized(_))));

        client.login().await.unwrap();
        let counters = client.get_counters().await.unwrap();
        assert_eq!(
            counters,
            Counters {
                upload_speed: 1024,
                download_speed: 2048,
                cumulative_uploaded: 900000,
                cumulative_downloaded: 500000,
            }
        );
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let addr = serve(fake_qbittorrent()).await;
        let mut cfg = config("q", ClientKind::Qbittorrent, addr.to_string());
        cfg.password = "wrong".to_string();
        let client = QbittorrentClient::new(&cfg).unwrap();
        assert!(matches!(client.login().await, Err(ClientError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_list_jobs_fills_trackers_and_comment() {
        let addr = serve(fake_qbittorrent()).await;
        let client = QbittorrentClient::new(&config("q", ClientKind::Qbittorrent, addr.to_string())).unwrap();
        client.login().await.unwrap();

        let jobs = client.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);

        assert_eq!(jobs[0].hash, "aaa");
        assert_eq!(jobs[0].state, "stalledUP");
        assert_eq!(jobs[0].trackers, vec![Tracker { url: "https://tracker.example.com/announce".to_string() }]);
        assert_eq!(jobs[0].comment, "https://example.com/details.php?id=7");
        assert_eq!(jobs[0].uploaded, 42);

        assert_eq!(jobs[1].trackers, vec![Tracker { url: "udp://tracker.other.org:1337/announce".to_string() }]);
        assert_eq!(jobs[1].comment, "12345");
        assert!((jobs[1].progress - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let client = QbittorrentClient::new(&config("q", ClientKind::Qbittorrent, "127.0.0.1:1".to_string())).unwrap();
        assert!(matches!(client.login().await, Err(ClientError::Unreachable(_))));
    }

    #[test]
    fn test_is_announce_url() {
        assert!(is_announce_url("https://t.example.com/announce"));
        assert!(is_announce_url("udp://t.example.com:80"));
        assert!(!is_announce_url("** [LSD] **"));
    }
}
