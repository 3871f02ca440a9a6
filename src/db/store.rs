//! Storage interface shared by the SQLite, PostgreSQL and MySQL backends.
//!
//! Every backend implements the same upsert and merge semantics; only the
//! SQL spelling differs. Connections are opened per call and closed again, so
//! an idle engine never sits on a stale handle.

use super::models::*;
use super::{MysqlStore, PostgresStore, SqliteStore};
use crate::config::ClientConfig;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Upper bound on rows bound into a single multi-row statement.
pub const MAX_ROWS_PER_STATEMENT: usize = 500;

/// Drops per-client upload totals whose job row is gone.
pub(crate) const DELETE_ORPHAN_UPLOADS: &str =
    "DELETE FROM job_uploads WHERE NOT EXISTS (SELECT 1 FROM jobs j WHERE j.hash = job_uploads.hash)";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("unsupported database url: {0}")]
    InvalidUrl(String),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// SQL dialect behind a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Mysql => write!(f, "mysql"),
        }
    }
}

/// Persistence contract for samples, rollups, jobs and the directory tables.
#[async_trait]
pub trait Store: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Create tables and indexes if missing.
    async fn migrate(&self) -> Result<(), DbError>;

    // --- Traffic ---

    /// Upsert samples keyed by `(timestamp, client_id)`; the last write wins.
    /// All rows commit together or not at all.
    async fn upsert_samples(&self, samples: &[Sample]) -> Result<usize, DbError>;

    /// Raw samples in `[start, end)`, ordered by time.
    async fn get_raw_samples(
        &self,
        client_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, DbError>;

    /// Hourly rollups whose bucket starts in `[start, end)`, ordered by time.
    async fn get_hourly_rollups(
        &self,
        client_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyRollup>, DbError>;

    /// Fold every raw sample older than `cutoff` into hourly rollups with a
    /// weighted merge, then delete those raw rows, in one transaction.
    async fn fold_into_hourly(&self, cutoff: DateTime<Utc>) -> Result<FoldSummary, DbError>;

    // --- Clients ---

    /// Mirror the configured client list into the registry table.
    async fn sync_clients(&self, clients: &[ClientConfig]) -> Result<(), DbError>;

    /// Remember the counters a client reported at startup.
    async fn record_baseline(
        &self,
        client_id: &str,
        uploaded: i64,
        downloaded: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    async fn get_clients(&self) -> Result<Vec<ClientRow>, DbError>;

    // --- Sites ---

    async fn get_sites(&self) -> Result<Vec<SiteRow>, DbError>;

    /// Insert or replace a site keyed by nickname.
    async fn upsert_site(&self, site: &SiteRow) -> Result<(), DbError>;

    // --- Jobs ---

    /// Hash, owner and state of every job row.
    async fn get_job_keys(&self) -> Result<Vec<JobKey>, DbError>;

    /// Apply one reconciliation pass atomically. Rows in the protected state
    /// are never deleted.
    async fn apply_reconcile(&self, plan: &ReconcilePlan) -> Result<ReconcileSummary, DbError>;

    async fn get_jobs(&self, client_id: Option<&str>) -> Result<Vec<JobView>, DbError>;

    async fn get_job(&self, hash: &str) -> Result<Option<JobView>, DbError>;
}

/// Open the store named by `url` and bring its schema up to date.
///
/// Accepted forms: `sqlite://path`, `sqlite:path`, a bare file path,
/// `postgres://…`, `postgresql://…` and `mysql://…`.
pub async fn open_store(url: &str) -> Result<Arc<dyn Store>, DbError> {
    let store: Arc<dyn Store> = if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Arc::new(PostgresStore::new(url))
    } else if url.starts_with("mysql://") {
        Arc::new(MysqlStore::new(url))
    } else if let Some(path) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) {
        Arc::new(SqliteStore::new(path))
    } else if !url.contains("://") {
        Arc::new(SqliteStore::new(url))
    } else {
        return Err(DbError::InvalidUrl(url.to_string()));
    };

    store.migrate().await?;
    Ok(store)
}

/// Split an embedded migration file into individual statements.
pub(crate) fn migration_statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|s| !s.is_empty())
}

/// Server-side timestamps are stored without a zone and are always UTC.
pub(crate) fn utc(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt, Utc)
}
