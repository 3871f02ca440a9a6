//! Configuration module for SeedWatch.
//!
//! Process settings come from environment variables with sensible defaults.
//! The client list and engine tunables come from a JSON file that is re-read
//! while running, so clients can be added or disabled without a restart.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the read API (default: 8080)
    pub http_port: u16,
    /// Database URL; `sqlite://`, `postgres://` or `mysql://` (default: "sqlite://seedwatch.db")
    pub database_url: String,
    /// Path to the engine JSON configuration (default: "config.json")
    pub config_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            database_url: "sqlite://seedwatch.db".to_string(),
            config_path: PathBuf::from("config.json"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SEEDWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `SEEDWATCH_DATABASE_URL`: Database URL (default: "sqlite://seedwatch.db")
    /// - `SEEDWATCH_CONFIG`: Engine config file (default: "config.json")
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("SEEDWATCH_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(url) = env::var("SEEDWATCH_DATABASE_URL") {
            cfg.database_url = url;
        }

        if let Ok(path) = env::var("SEEDWATCH_CONFIG") {
            cfg.config_path = PathBuf::from(path);
        }

        cfg
    }
}

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Download client wire protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Qbittorrent,
    Transmission,
    #[serde(other)]
    Unknown,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Qbittorrent => "qbittorrent",
            ClientKind::Transmission => "transmission",
            ClientKind::Unknown => "unknown",
        }
    }
}

fn default_proxy_port() -> u16 {
    9090
}

/// One configured download client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ClientKind,
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub enabled: bool,
    /// Reach the client through the HTTP relay running next to it.
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
}

impl ClientConfig {
    /// Whether calls go through the relay. Only qBittorrent is relayed.
    pub fn uses_relay(&self) -> bool {
        self.use_proxy && self.kind == ClientKind::Qbittorrent
    }
}

fn default_realtime() -> bool {
    true
}

fn default_retention_hours() -> i64 {
    48
}

fn default_reconcile_interval() -> u64 {
    900
}

fn default_aggregation_interval() -> u64 {
    21600
}

/// Engine tunables and the client list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub downloaders: Vec<ClientConfig>,
    /// Poll every second instead of every minute.
    #[serde(default = "default_realtime")]
    pub realtime_speed_enabled: bool,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            downloaders: Vec::new(),
            realtime_speed_enabled: default_realtime(),
            retention_hours: default_retention_hours(),
            reconcile_interval_secs: default_reconcile_interval(),
            aggregation_interval_secs: default_aggregation_interval(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        if self.realtime_speed_enabled {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(60)
        }
    }

    pub fn enabled_clients(&self) -> impl Iterator<Item = &ClientConfig> {
        self.downloaders.iter().filter(|d| d.enabled)
    }
}

/// Read-only source of engine configuration snapshots.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<EngineConfig, ConfigError>;
}

/// Engine configuration stored as a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileConfig {
    path: PathBuf,
}

impl JsonFileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for JsonFileConfig {
    fn load(&self) -> Result<EngineConfig, ConfigError> {
        let data = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// A fixed snapshot, mostly useful for tests and one-off runs.
impl ConfigSource for EngineConfig {
    fn load(&self) -> Result<EngineConfig, ConfigError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.database_url, "sqlite://seedwatch.db");
    }

    #[test]
    fn test_engine_config_defaults_and_kinds() {
        let json = r#"{
            "downloaders": [
                {"id": "a", "name": "qb", "type": "qbittorrent", "host": "10.0.0.2:8080", "enabled": true, "use_proxy": true},
                {"id": "b", "name": "tr", "type": "transmission", "host": "10.0.0.3", "use_proxy": true},
                {"id": "c", "name": "odd", "type": "deluge", "host": "x"}
            ]
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();

        assert!(cfg.realtime_speed_enabled);
        assert_eq!(cfg.retention_hours, 48);
        assert_eq!(cfg.reconcile_interval_secs, 900);
        assert_eq!(cfg.aggregation_interval_secs, 21600);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));

        assert_eq!(cfg.downloaders[0].proxy_port, 9090);
        assert!(cfg.downloaders[0].uses_relay());
        assert!(!cfg.downloaders[1].uses_relay());
        assert_eq!(cfg.downloaders[2].kind, ClientKind::Unknown);
        assert_eq!(cfg.enabled_clients().count(), 1);
    }

    #[test]
    fn test_json_file_config() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), r#"{"realtime_speed_enabled": false}"#).unwrap();

        let cfg = JsonFileConfig::new(tmp.path()).load().unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(60));
        assert!(cfg.downloaders.is_empty());

        std::fs::write(tmp.path(), "not json").unwrap();
        assert!(matches!(JsonFileConfig::new(tmp.path()).load(), Err(ConfigError::Parse(_))));
    }
}
