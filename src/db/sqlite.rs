//! SQLite database store implementation.

use super::models::*;
use super::rollup::rollup_samples;
use super::store::{DbError, Dialect, Store, DELETE_ORPHAN_UPLOADS, MAX_ROWS_PER_STATEMENT};
use crate::config::ClientConfig;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row,
    TransactionBehavior,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const UPSERT_HOURLY: &str = "INSERT INTO traffic_hourly
    (hour_start, client_id, delta_uploaded, delta_downloaded, avg_upload_speed, avg_download_speed, sample_count)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT(hour_start, client_id) DO UPDATE SET
    delta_uploaded = traffic_hourly.delta_uploaded + excluded.delta_uploaded,
    delta_downloaded = traffic_hourly.delta_downloaded + excluded.delta_downloaded,
    avg_upload_speed = (traffic_hourly.avg_upload_speed * traffic_hourly.sample_count + excluded.avg_upload_speed * excluded.sample_count) / (traffic_hourly.sample_count + excluded.sample_count),
    avg_download_speed = (traffic_hourly.avg_download_speed * traffic_hourly.sample_count + excluded.avg_download_speed * excluded.sample_count) / (traffic_hourly.sample_count + excluded.sample_count),
    sample_count = traffic_hourly.sample_count + excluded.sample_count";

const UPSERT_JOB: &str = "INSERT INTO jobs
    (hash, name, save_path, size, progress, state, site, release_group, details, client_id, last_seen)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    ON CONFLICT(hash) DO UPDATE SET
    name = excluded.name, save_path = excluded.save_path, size = excluded.size,
    progress = excluded.progress, state = excluded.state, site = excluded.site,
    release_group = excluded.release_group,
    details = CASE WHEN excluded.details IS NOT NULL AND excluded.details != '' THEN excluded.details ELSE jobs.details END,
    client_id = excluded.client_id, last_seen = excluded.last_seen";

const UPSERT_UPLOAD: &str = "INSERT INTO job_uploads (hash, client_id, uploaded) VALUES (?1, ?2, ?3)
    ON CONFLICT(hash, client_id) DO UPDATE SET uploaded = excluded.uploaded";

const SELECT_JOBS: &str = "SELECT j.hash, j.name, j.save_path, j.size, j.progress, j.state, j.site,
    j.release_group, j.details, j.client_id, j.last_seen, j.external_checked_at,
    COALESCE((SELECT SUM(u.uploaded) FROM job_uploads u WHERE u.hash = j.hash), 0)
    FROM jobs j";

/// SQLite store. Each call opens its own connection on a blocking thread.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DbError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            conn.busy_timeout(Duration::from_secs(30))?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn migrate(&self) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute_batch(include_str!("../../migrations/sqlite/000001_init.up.sql"))
                .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))
        })
        .await
    }

    async fn upsert_samples(&self, samples: &[Sample]) -> Result<usize, DbError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let samples = samples.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0;

            for chunk in samples.chunks(MAX_ROWS_PER_STATEMENT) {
                let placeholders = vec!["(?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
                let sql = format!(
                    "INSERT INTO traffic_raw (sampled_at, client_id, cumulative_uploaded, cumulative_downloaded, upload_speed, download_speed)
                     VALUES {}
                     ON CONFLICT(sampled_at, client_id) DO UPDATE SET
                     cumulative_uploaded = excluded.cumulative_uploaded,
                     cumulative_downloaded = excluded.cumulative_downloaded,
                     upload_speed = excluded.upload_speed,
                     download_speed = excluded.download_speed",
                    placeholders
                );

                let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * 6);
                for s in chunk {
                    values.push(Value::Text(format_db_time(s.timestamp)));
                    values.push(Value::Text(s.client_id.clone()));
                    values.push(Value::Integer(s.cumulative_uploaded));
                    values.push(Value::Integer(s.cumulative_downloaded));
                    values.push(Value::Integer(s.upload_speed));
                    values.push(Value::Integer(s.download_speed));
                }

                written += tx.execute(&sql, params_from_iter(values))?;
            }

            tx.commit()?;
            Ok(written)
        })
        .await
    }

    async fn get_raw_samples(
        &self,
        client_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, DbError> {
        let mut sql = String::from(
            "SELECT sampled_at, client_id, cumulative_uploaded, cumulative_downloaded, upload_speed, download_speed
             FROM traffic_raw WHERE sampled_at >= ? AND sampled_at < ?",
        );
        let mut values = vec![
            Value::Text(format_db_time(start)),
            Value::Text(format_db_time(end)),
        ];
        if let Some(id) = client_id {
            sql.push_str(" AND client_id = ?");
            values.push(Value::Text(id.to_string()));
        }
        sql.push_str(" ORDER BY sampled_at ASC, client_id ASC");

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let samples = stmt
                .query_map(params_from_iter(values), sample_from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(samples)
        })
        .await
    }

    async fn get_hourly_rollups(
        &self,
        client_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyRollup>, DbError> {
        let mut sql = String::from(
            "SELECT hour_start, client_id, delta_uploaded, delta_downloaded, avg_upload_speed, avg_download_speed, sample_count
             FROM traffic_hourly WHERE hour_start >= ? AND hour_start < ?",
        );
        let mut values = vec![
            Value::Text(format_db_time(start)),
            Value::Text(format_db_time(end)),
        ];
        if let Some(id) = client_id {
            sql.push_str(" AND client_id = ?");
            values.push(Value::Text(id.to_string()));
        }
        sql.push_str(" ORDER BY hour_start ASC, client_id ASC");

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rollups = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok(HourlyRollup {
                        hour: time_column(row, 0)?,
                        client_id: row.get(1)?,
                        delta_uploaded: row.get(2)?,
                        delta_downloaded: row.get(3)?,
                        avg_upload_speed: row.get(4)?,
                        avg_download_speed: row.get(5)?,
                        sample_count: row.get(6)?,
                    })
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(rollups)
        })
        .await
    }

    async fn fold_into_hourly(&self, cutoff: DateTime<Utc>) -> Result<FoldSummary, DbError> {
        let cutoff = format_db_time(cutoff);

        self.with_conn(move |conn| {
            // Take the write lock up front so no sample can land below the
            // cutoff between the read and the delete.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let samples = {
                let mut stmt = tx.prepare(
                    "SELECT sampled_at, client_id, cumulative_uploaded, cumulative_downloaded, upload_speed, download_speed
                     FROM traffic_raw WHERE sampled_at < ?1 ORDER BY sampled_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], sample_from_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                rows
            };

            if samples.is_empty() {
                return Ok(FoldSummary::default());
            }

            let rollups = rollup_samples(&samples);
            {
                let mut stmt = tx.prepare(UPSERT_HOURLY)?;
                for r in &rollups {
                    stmt.execute(params![
                        format_db_time(r.hour),
                        r.client_id,
                        r.delta_uploaded,
                        r.delta_downloaded,
                        r.avg_upload_speed,
                        r.avg_download_speed,
                        r.sample_count,
                    ])?;
                }
            }

            let raw_deleted = tx.execute("DELETE FROM traffic_raw WHERE sampled_at < ?1", params![cutoff])?;
            tx.commit()?;

            Ok(FoldSummary {
                rollups: rollups.len(),
                raw_deleted,
            })
        })
        .await
    }

    async fn sync_clients(&self, clients: &[ClientConfig]) -> Result<(), DbError> {
        if clients.is_empty() {
            return Ok(());
        }

        let clients = clients.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO clients (id, name, kind) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, kind = excluded.kind",
                )?;
                for c in &clients {
                    stmt.execute(params![c.id, c.name, c.kind.as_str()])?;
                }
            }

            let placeholders = vec!["?"; clients.len()].join(", ");
            tx.execute(
                &format!("DELETE FROM clients WHERE id NOT IN ({})", placeholders),
                params_from_iter(clients.iter().map(|c| c.id.as_str())),
            )?;

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn record_baseline(
        &self,
        client_id: &str,
        uploaded: i64,
        downloaded: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let client_id = client_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE clients SET baseline_uploaded = ?1, baseline_downloaded = ?2, baseline_at = ?3 WHERE id = ?4",
                params![uploaded, downloaded, format_db_time(at), client_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_clients(&self) -> Result<Vec<ClientRow>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, kind, baseline_uploaded, baseline_downloaded, baseline_at FROM clients ORDER BY name",
            )?;
            let clients = stmt
                .query_map([], |row| {
                    Ok(ClientRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: row.get(2)?,
                        baseline_uploaded: row.get(3)?,
                        baseline_downloaded: row.get(4)?,
                        baseline_at: optional_time_column(row, 5)?,
                    })
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(clients)
        })
        .await
    }

    async fn get_sites(&self) -> Result<Vec<SiteRow>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT nickname, base_url, special_tracker_domain, group_aliases FROM sites ORDER BY id",
            )?;
            let sites = stmt
                .query_map([], |row| {
                    Ok(SiteRow {
                        nickname: row.get(0)?,
                        base_url: row.get(1)?,
                        special_tracker_domain: row.get(2)?,
                        groups: row.get(3)?,
                    })
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(sites)
        })
        .await
    }

    async fn upsert_site(&self, site: &SiteRow) -> Result<(), DbError> {
        let site = site.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sites (nickname, base_url, special_tracker_domain, group_aliases) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(nickname) DO UPDATE SET base_url = excluded.base_url,
                 special_tracker_domain = excluded.special_tracker_domain, group_aliases = excluded.group_aliases",
                params![site.nickname, site.base_url, site.special_tracker_domain, site.groups],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_job_keys(&self) -> Result<Vec<JobKey>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT hash, client_id, state FROM jobs")?;
            let keys = stmt
                .query_map([], |row| {
                    Ok(JobKey {
                        hash: row.get(0)?,
                        client_id: row.get(1)?,
                        state: row.get(2)?,
                    })
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn apply_reconcile(&self, plan: &ReconcilePlan) -> Result<ReconcileSummary, DbError> {
        let plan = plan.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut summary = ReconcileSummary::default();

            for (client_id, hashes) in &plan.vanished {
                for chunk in hashes.chunks(MAX_ROWS_PER_STATEMENT) {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let sql = format!(
                        "DELETE FROM jobs WHERE client_id = ? AND state != ? AND hash IN ({})",
                        placeholders
                    );
                    let mut values = vec![
                        Value::Text(client_id.clone()),
                        Value::Text(PROTECTED_STATE.to_string()),
                    ];
                    values.extend(chunk.iter().cloned().map(Value::Text));
                    summary.vanished_deleted += tx.execute(&sql, params_from_iter(values))?;
                }
            }

            {
                let mut stmt = tx.prepare(UPSERT_JOB)?;
                for job in &plan.upserts {
                    stmt.execute(params![
                        job.hash,
                        job.name,
                        job.save_path,
                        job.size,
                        job.progress,
                        job.state,
                        job.site,
                        job.group,
                        job.details,
                        job.client_id,
                        format_db_time(job.last_seen),
                    ])?;
                    summary.upserted += 1;
                }
            }

            {
                let mut stmt = tx.prepare(UPSERT_UPLOAD)?;
                for u in &plan.uploads {
                    stmt.execute(params![u.hash, u.client_id, u.uploaded])?;
                    summary.uploads += 1;
                }
            }

            if !plan.removed_clients.is_empty() {
                let placeholders = vec!["?"; plan.removed_clients.len()].join(", ");
                let sql = format!(
                    "DELETE FROM jobs WHERE state != ? AND client_id IN ({})",
                    placeholders
                );
                let mut values = vec![Value::Text(PROTECTED_STATE.to_string())];
                values.extend(plan.removed_clients.iter().cloned().map(Value::Text));
                summary.removed_client_deleted = tx.execute(&sql, params_from_iter(values))?;
            }

            if summary.vanished_deleted + summary.removed_client_deleted > 0 {
                summary.orphan_uploads_deleted = tx.execute(DELETE_ORPHAN_UPLOADS, [])?;
            }

            tx.commit()?;
            Ok(summary)
        })
        .await
    }

    async fn get_jobs(&self, client_id: Option<&str>) -> Result<Vec<JobView>, DbError> {
        let mut sql = String::from(SELECT_JOBS);
        let mut values = Vec::new();
        if let Some(id) = client_id {
            sql.push_str(" WHERE j.client_id = ?");
            values.push(Value::Text(id.to_string()));
        }
        sql.push_str(" ORDER BY j.name ASC");

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let jobs = stmt
                .query_map(params_from_iter(values), job_from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(jobs)
        })
        .await
    }

    async fn get_job(&self, hash: &str) -> Result<Option<JobView>, DbError> {
        let hash = hash.to_string();
        self.with_conn(move |conn| {
            let sql = format!("{} WHERE j.hash = ?1", SELECT_JOBS);
            Ok(conn.query_row(&sql, params![hash], job_from_row).optional()?)
        })
        .await
    }
}

fn sample_from_row(row: &Row<'_>) -> SqlResult<Sample> {
    Ok(Sample {
        timestamp: time_column(row, 0)?,
        client_id: row.get(1)?,
        cumulative_uploaded: row.get(2)?,
        cumulative_downloaded: row.get(3)?,
        upload_speed: row.get(4)?,
        download_speed: row.get(5)?,
    })
}

fn job_from_row(row: &Row<'_>) -> SqlResult<JobView> {
    Ok(JobView {
        record: JobRecord {
            hash: row.get(0)?,
            name: row.get(1)?,
            save_path: row.get(2)?,
            size: row.get(3)?,
            progress: row.get(4)?,
            state: row.get(5)?,
            site: row.get(6)?,
            group: row.get(7)?,
            details: row.get(8)?,
            client_id: row.get(9)?,
            last_seen: time_column(row, 10)?,
            external_checked_at: optional_time_column(row, 11)?,
        },
        total_uploaded: row.get(12)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("bad timestamp {:?}", s).into())
    })
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => parse_db_time(&s).map(Some).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("bad timestamp {:?}", s).into())
        }),
        None => Ok(None),
    }
}

/// Format a timestamp the way it is stored; fixed width so text order is time order.
pub fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientKind;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("test.db"));
        store.migrate().await.unwrap();
        (dir, store)
    }

    fn sample(ts: DateTime<Utc>, client: &str, ul: i64) -> Sample {
        Sample {
            timestamp: ts,
            client_id: client.to_string(),
            cumulative_uploaded: ul,
            cumulative_downloaded: ul / 2,
            upload_speed: 10,
            download_speed: 5,
        }
    }

    fn job(hash: &str, client: &str, state: &str) -> JobRecord {
        JobRecord {
            hash: hash.to_string(),
            name: format!("Name.{}", hash),
            save_path: "/data".to_string(),
            size: 1024,
            progress: 100.0,
            state: state.to_string(),
            site: None,
            group: None,
            details: None,
            client_id: client.to_string(),
            last_seen: Utc::now(),
            external_checked_at: None,
        }
    }

    #[test]
    fn test_time_roundtrip_preserves_order() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let b = a + ChronoDuration::milliseconds(1);
        assert!(format_db_time(a) < format_db_time(b));
        assert_eq!(parse_db_time(&format_db_time(b)), Some(b));
        assert_eq!(
            parse_db_time("2024-01-01 09:00:00"),
            Some(a)
        );
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let (_dir, store) = test_store().await;
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_replayed_batch_is_idempotent() {
        let (_dir, store) = test_store().await;
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let batch = vec![sample(t0, "c1", 1000), sample(t0 + ChronoDuration::seconds(1), "c1", 1100)];

        store.upsert_samples(&batch).await.unwrap();
        store.upsert_samples(&batch).await.unwrap();

        let rows = store
            .get_raw_samples(Some("c1"), t0, t0 + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(rows, batch);
    }

    #[tokio::test]
    async fn test_upsert_last_writer_wins() {
        let (_dir, store) = test_store().await;
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        store.upsert_samples(&[sample(t0, "c1", 1000)]).await.unwrap();
        store.upsert_samples(&[sample(t0, "c1", 2000)]).await.unwrap();

        let rows = store.get_raw_samples(None, t0, t0 + ChronoDuration::seconds(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cumulative_uploaded, 2000);
    }

    #[tokio::test]
    async fn test_upsert_chunks_large_batches() {
        let (_dir, store) = test_store().await;
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let batch: Vec<_> = (0..(MAX_ROWS_PER_STATEMENT as i64 * 2 + 7))
            .map(|i| sample(t0 + ChronoDuration::seconds(i), "c1", i))
            .collect();

        let written = store.upsert_samples(&batch).await.unwrap();
        assert_eq!(written, batch.len());
    }

    #[tokio::test]
    async fn test_fold_merges_into_existing_rollup() {
        let (_dir, store) = test_store().await;
        let hour = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        store
            .upsert_samples(&[sample(hour, "c1", 1000), sample(hour + ChronoDuration::minutes(10), "c1", 1200)])
            .await
            .unwrap();
        let first = store.fold_into_hourly(hour + ChronoDuration::minutes(20)).await.unwrap();
        assert_eq!(first, FoldSummary { rollups: 1, raw_deleted: 2 });

        // Later samples in the same hour merge into the existing bucket.
        store
            .upsert_samples(&[
                sample(hour + ChronoDuration::minutes(30), "c1", 1300),
                sample(hour + ChronoDuration::minutes(40), "c1", 1500),
                sample(hour + ChronoDuration::minutes(50), "c1", 1600),
            ])
            .await
            .unwrap();
        store.fold_into_hourly(hour + ChronoDuration::hours(2)).await.unwrap();

        let rollups = store
            .get_hourly_rollups(Some("c1"), hour, hour + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].sample_count, 5);
        assert_eq!(rollups[0].delta_uploaded, 200 + 300);
        assert!((rollups[0].avg_upload_speed - 10.0).abs() < 1e-9);

        let raw = store.get_raw_samples(None, hour, hour + ChronoDuration::hours(2)).await.unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn test_fold_leaves_rows_after_cutoff() {
        let (_dir, store) = test_store().await;
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        store
            .upsert_samples(&[sample(t0, "c1", 1), sample(t0 + ChronoDuration::hours(5), "c1", 2)])
            .await
            .unwrap();

        let summary = store.fold_into_hourly(t0 + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(summary.raw_deleted, 1);

        let raw = store.get_raw_samples(None, t0, t0 + ChronoDuration::days(1)).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].timestamp, t0 + ChronoDuration::hours(5));
    }

    #[tokio::test]
    async fn test_fold_with_nothing_to_do() {
        let (_dir, store) = test_store().await;
        let summary = store.fold_into_hourly(Utc::now()).await.unwrap();
        assert_eq!(summary, FoldSummary::default());
    }

    #[tokio::test]
    async fn test_clients_sync_and_baseline() {
        let (_dir, store) = test_store().await;
        let mk = |id: &str| ClientConfig {
            id: id.to_string(),
            name: format!("client-{}", id),
            kind: ClientKind::Qbittorrent,
            host: "localhost".to_string(),
            username: String::new(),
            password: String::new(),
            enabled: true,
            use_proxy: false,
            proxy_port: 9090,
        };

        store.sync_clients(&[mk("a"), mk("b")]).await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.record_baseline("a", 500, 700, at).await.unwrap();
        store.sync_clients(&[mk("a")]).await.unwrap();

        let clients = store.get_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].baseline_uploaded, 500);
        assert_eq!(clients[0].baseline_downloaded, 700);
        assert_eq!(clients[0].baseline_at, Some(at));
    }

    #[tokio::test]
    async fn test_reconcile_spares_protected_rows() {
        let (_dir, store) = test_store().await;
        store
            .apply_reconcile(&ReconcilePlan {
                upserts: vec![job("a", "c1", "seeding"), job("p", "c1", PROTECTED_STATE), job("x", "gone", "seeding")],
                ..Default::default()
            })
            .await
            .unwrap();

        let summary = store
            .apply_reconcile(&ReconcilePlan {
                vanished: vec![("c1".to_string(), vec!["a".to_string(), "p".to_string()])],
                removed_clients: vec!["gone".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.vanished_deleted, 1);
        assert_eq!(summary.removed_client_deleted, 1);
        let keys = store.get_job_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].hash, "p");
    }

    #[tokio::test]
    async fn test_deleted_jobs_take_their_upload_totals() {
        let (_dir, store) = test_store().await;
        let upload = |hash: &str, client_id: &str, uploaded: i64| UploadStat {
            hash: hash.to_string(),
            client_id: client_id.to_string(),
            uploaded,
        };
        store
            .apply_reconcile(&ReconcilePlan {
                upserts: vec![job("a", "c1", "seeding"), job("p", "c1", PROTECTED_STATE), job("x", "gone", "seeding")],
                uploads: vec![upload("a", "c1", 10), upload("a", "c2", 5), upload("p", "c1", 7), upload("x", "gone", 3)],
                ..Default::default()
            })
            .await
            .unwrap();

        let summary = store
            .apply_reconcile(&ReconcilePlan {
                vanished: vec![("c1".to_string(), vec!["a".to_string(), "p".to_string()])],
                removed_clients: vec!["gone".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.orphan_uploads_deleted, 3);
        assert_eq!(store.get_job("p").await.unwrap().unwrap().total_uploaded, 7);

        // A job seen again starts from its fresh totals only.
        store
            .apply_reconcile(&ReconcilePlan {
                upserts: vec![job("a", "c1", "seeding")],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(store.get_job("a").await.unwrap().unwrap().total_uploaded, 0);
    }

    #[tokio::test]
    async fn test_job_upsert_keeps_details_and_check_time() {
        let (_dir, store) = test_store().await;
        let mut first = job("h", "c1", "seeding");
        first.details = Some("https://example.com/details.php?id=1".to_string());
        store
            .apply_reconcile(&ReconcilePlan { upserts: vec![first], ..Default::default() })
            .await
            .unwrap();

        let mut second = job("h", "c2", "paused");
        second.details = None;
        store
            .apply_reconcile(&ReconcilePlan {
                upserts: vec![second],
                uploads: vec![
                    UploadStat { hash: "h".to_string(), client_id: "c1".to_string(), uploaded: 100 },
                    UploadStat { hash: "h".to_string(), client_id: "c2".to_string(), uploaded: 50 },
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let view = store.get_job("h").await.unwrap().unwrap();
        assert_eq!(view.record.client_id, "c2");
        assert_eq!(view.record.state, "paused");
        assert_eq!(view.record.details.as_deref(), Some("https://example.com/details.php?id=1"));
        assert_eq!(view.total_uploaded, 150);

        assert_eq!(store.get_jobs(Some("c1")).await.unwrap().len(), 0);
        assert_eq!(store.get_jobs(None).await.unwrap().len(), 1);
        assert!(store.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sites_upsert() {
        let (_dir, store) = test_store().await;
        let mut site = SiteRow {
            nickname: "SiteX".to_string(),
            base_url: "example.com".to_string(),
            special_tracker_domain: None,
            groups: Some("GrpA".to_string()),
        };
        store.upsert_site(&site).await.unwrap();
        site.groups = Some("GrpA,GrpB".to_string());
        store.upsert_site(&site).await.unwrap();

        let sites = store.get_sites().await.unwrap();
        assert_eq!(sites, vec![site]);
    }
}
