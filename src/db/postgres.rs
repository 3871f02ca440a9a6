//! PostgreSQL store implementation.

use super::models::*;
use super::rollup::rollup_samples;
use super::store::{migration_statements, utc, DbError, Dialect, Store, DELETE_ORPHAN_UPLOADS, MAX_ROWS_PER_STATEMENT};
use crate::config::ClientConfig;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder, Row};
use std::collections::HashMap;

const SELECT_JOBS: &str = "SELECT j.hash, j.name, j.save_path, j.size, j.progress, j.state, j.site,
    j.release_group, j.details, j.client_id, j.last_seen, j.external_checked_at,
    COALESCE((SELECT SUM(u.uploaded) FROM job_uploads u WHERE u.hash = j.hash), 0)::BIGINT AS total_uploaded
    FROM jobs j";

/// PostgreSQL store. Each call opens a connection and closes it when done.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    url: String,
}

impl PostgresStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn connect(&self) -> Result<PgConnection, DbError> {
        Ok(PgConnection::connect(&self.url).await?)
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn migrate(&self) -> Result<(), DbError> {
        let mut conn = self.connect().await?;
        for stmt in migration_statements(include_str!("../../migrations/postgres/000001_init.up.sql")) {
            sqlx::query(stmt)
                .execute(&mut conn)
                .await
                .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        }
        conn.close().await?;
        Ok(())
    }

    async fn upsert_samples(&self, samples: &[Sample]) -> Result<usize, DbError> {
        if samples.is_empty() {
            return Ok(0);
        }

        // A single INSERT .. ON CONFLICT may not touch the same key twice.
        let samples = last_per_key(samples);

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let mut written = 0;
        for chunk in samples.chunks(MAX_ROWS_PER_STATEMENT) {
            written += sample_upsert(chunk).build().execute(&mut *tx).await?.rows_affected() as usize;
        }
        tx.commit().await?;
        conn.close().await?;
        Ok(written)
    }

    async fn get_raw_samples(
        &self,
        client_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, DbError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT sampled_at, client_id, cumulative_uploaded, cumulative_downloaded, upload_speed, download_speed
             FROM traffic_raw WHERE sampled_at >= ",
        );
        qb.push_bind(start.naive_utc())
            .push(" AND sampled_at < ")
            .push_bind(end.naive_utc());
        if let Some(id) = client_id {
            qb.push(" AND client_id = ").push_bind(id.to_string());
        }
        qb.push(" ORDER BY sampled_at ASC, client_id ASC");

        let mut conn = self.connect().await?;
        let rows = qb.build().fetch_all(&mut conn).await?;
        conn.close().await?;

        Ok(rows.iter().map(sample_from_row).collect::<Result<_, _>>()?)
    }

    async fn get_hourly_rollups(
        &self,
        client_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyRollup>, DbError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT hour_start, client_id, delta_uploaded, delta_downloaded, avg_upload_speed, avg_download_speed, sample_count
             FROM traffic_hourly WHERE hour_start >= ",
        );
        qb.push_bind(start.naive_utc())
            .push(" AND hour_start < ")
            .push_bind(end.naive_utc());
        if let Some(id) = client_id {
            qb.push(" AND client_id = ").push_bind(id.to_string());
        }
        qb.push(" ORDER BY hour_start ASC, client_id ASC");

        let mut conn = self.connect().await?;
        let rows = qb.build().fetch_all(&mut conn).await?;
        conn.close().await?;

        rows.iter()
            .map(|row| {
                Ok(HourlyRollup {
                    hour: utc(row.try_get("hour_start")?),
                    client_id: row.try_get("client_id")?,
                    delta_uploaded: row.try_get("delta_uploaded")?,
                    delta_downloaded: row.try_get("delta_downloaded")?,
                    avg_upload_speed: row.try_get("avg_upload_speed")?,
                    avg_download_speed: row.try_get("avg_download_speed")?,
                    sample_count: row.try_get("sample_count")?,
                })
            })
            .collect()
    }

    async fn fold_into_hourly(&self, cutoff: DateTime<Utc>) -> Result<FoldSummary, DbError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;

        // DELETE .. RETURNING hands back exactly the rows removed, so nothing
        // inserted concurrently can be dropped without being folded.
        let rows = sqlx::query(
            "DELETE FROM traffic_raw WHERE sampled_at < $1
             RETURNING sampled_at, client_id, cumulative_uploaded, cumulative_downloaded, upload_speed, download_speed",
        )
        .bind(cutoff.naive_utc())
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.rollback().await?;
            conn.close().await?;
            return Ok(FoldSummary::default());
        }

        let samples = rows.iter().map(sample_from_row).collect::<Result<Vec<_>, _>>()?;
        let rollups = rollup_samples(&samples);
        for chunk in rollups.chunks(MAX_ROWS_PER_STATEMENT) {
            hourly_upsert(chunk).build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        conn.close().await?;

        Ok(FoldSummary {
            rollups: rollups.len(),
            raw_deleted: samples.len(),
        })
    }

    async fn sync_clients(&self, clients: &[ClientConfig]) -> Result<(), DbError> {
        if clients.is_empty() {
            return Ok(());
        }

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        for c in clients {
            sqlx::query(
                "INSERT INTO clients (id, name, kind) VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, kind = EXCLUDED.kind",
            )
            .bind(&c.id)
            .bind(&c.name)
            .bind(c.kind.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let ids: Vec<String> = clients.iter().map(|c| c.id.clone()).collect();
        sqlx::query("DELETE FROM clients WHERE NOT (id = ANY($1))")
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        conn.close().await?;
        Ok(())
    }

    async fn record_baseline(
        &self,
        client_id: &str,
        uploaded: i64,
        downloaded: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut conn = self.connect().await?;
        sqlx::query(
            "UPDATE clients SET baseline_uploaded = $1, baseline_downloaded = $2, baseline_at = $3 WHERE id = $4",
        )
        .bind(uploaded)
        .bind(downloaded)
        .bind(at.naive_utc())
        .bind(client_id)
        .execute(&mut conn)
        .await?;
        conn.close().await?;
        Ok(())
    }

    async fn get_clients(&self) -> Result<Vec<ClientRow>, DbError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(
            "SELECT id, name, kind, baseline_uploaded, baseline_downloaded, baseline_at FROM clients ORDER BY name",
        )
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        rows.iter()
            .map(|row| {
                Ok(ClientRow {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    kind: row.try_get("kind")?,
                    baseline_uploaded: row.try_get("baseline_uploaded")?,
                    baseline_downloaded: row.try_get("baseline_downloaded")?,
                    baseline_at: row.try_get::<Option<NaiveDateTime>, _>("baseline_at")?.map(utc),
                })
            })
            .collect()
    }

    async fn get_sites(&self) -> Result<Vec<SiteRow>, DbError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(
            "SELECT nickname, base_url, special_tracker_domain, group_aliases FROM sites ORDER BY id",
        )
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        rows.iter()
            .map(|row| {
                Ok(SiteRow {
                    nickname: row.try_get("nickname")?,
                    base_url: row.try_get("base_url")?,
                    special_tracker_domain: row.try_get("special_tracker_domain")?,
                    groups: row.try_get("group_aliases")?,
                })
            })
            .collect()
    }

    async fn upsert_site(&self, site: &SiteRow) -> Result<(), DbError> {
        let mut conn = self.connect().await?;
        sqlx::query(
            "INSERT INTO sites (nickname, base_url, special_tracker_domain, group_aliases) VALUES ($1, $2, $3, $4)
             ON CONFLICT (nickname) DO UPDATE SET base_url = EXCLUDED.base_url,
             special_tracker_domain = EXCLUDED.special_tracker_domain, group_aliases = EXCLUDED.group_aliases",
        )
        .bind(&site.nickname)
        .bind(&site.base_url)
        .bind(&site.special_tracker_domain)
        .bind(&site.groups)
        .execute(&mut conn)
        .await?;
        conn.close().await?;
        Ok(())
    }

    async fn get_job_keys(&self) -> Result<Vec<JobKey>, DbError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query("SELECT hash, client_id, state FROM jobs")
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;

        rows.iter()
            .map(|row| {
                Ok(JobKey {
                    hash: row.try_get("hash")?,
                    client_id: row.try_get("client_id")?,
                    state: row.try_get("state")?,
                })
            })
            .collect()
    }

    async fn apply_reconcile(&self, plan: &ReconcilePlan) -> Result<ReconcileSummary, DbError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let mut summary = ReconcileSummary::default();

        for (client_id, hashes) in &plan.vanished {
            if hashes.is_empty() {
                continue;
            }
            let result = sqlx::query("DELETE FROM jobs WHERE client_id = $1 AND state <> $2 AND hash = ANY($3)")
                .bind(client_id)
                .bind(PROTECTED_STATE)
                .bind(hashes)
                .execute(&mut *tx)
                .await?;
            summary.vanished_deleted += result.rows_affected() as usize;
        }

        for chunk in plan.upserts.chunks(MAX_ROWS_PER_STATEMENT) {
            job_upsert(chunk).build().execute(&mut *tx).await?;
            summary.upserted += chunk.len();
        }

        for chunk in plan.uploads.chunks(MAX_ROWS_PER_STATEMENT) {
            upload_upsert(chunk).build().execute(&mut *tx).await?;
            summary.uploads += chunk.len();
        }

        if !plan.removed_clients.is_empty() {
            let result = sqlx::query("DELETE FROM jobs WHERE state <> $1 AND client_id = ANY($2)")
                .bind(PROTECTED_STATE)
                .bind(&plan.removed_clients)
                .execute(&mut *tx)
                .await?;
            summary.removed_client_deleted = result.rows_affected() as usize;
        }

        if summary.vanished_deleted + summary.removed_client_deleted > 0 {
            let result = sqlx::query(DELETE_ORPHAN_UPLOADS).execute(&mut *tx).await?;
            summary.orphan_uploads_deleted = result.rows_affected() as usize;
        }

        tx.commit().await?;
        conn.close().await?;
        Ok(summary)
    }

    async fn get_jobs(&self, client_id: Option<&str>) -> Result<Vec<JobView>, DbError> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_JOBS);
        if let Some(id) = client_id {
            qb.push(" WHERE j.client_id = ").push_bind(id.to_string());
        }
        qb.push(" ORDER BY j.name ASC");

        let mut conn = self.connect().await?;
        let rows = qb.build().fetch_all(&mut conn).await?;
        conn.close().await?;

        Ok(rows.iter().map(job_from_row).collect::<Result<_, _>>()?)
    }

    async fn get_job(&self, hash: &str) -> Result<Option<JobView>, DbError> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(&format!("{} WHERE j.hash = $1", SELECT_JOBS))
            .bind(hash)
            .fetch_optional(&mut conn)
            .await?;
        conn.close().await?;

        Ok(row.as_ref().map(job_from_row).transpose()?)
    }
}

fn sample_upsert(chunk: &[Sample]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO traffic_raw (sampled_at, client_id, cumulative_uploaded, cumulative_downloaded, upload_speed, download_speed) ",
    );
    qb.push_values(chunk, |mut b, s| {
        b.push_bind(s.timestamp.naive_utc())
            .push_bind(s.client_id.clone())
            .push_bind(s.cumulative_uploaded)
            .push_bind(s.cumulative_downloaded)
            .push_bind(s.upload_speed)
            .push_bind(s.download_speed);
    });
    qb.push(
        " ON CONFLICT (sampled_at, client_id) DO UPDATE SET
        cumulative_uploaded = EXCLUDED.cumulative_uploaded,
        cumulative_downloaded = EXCLUDED.cumulative_downloaded,
        upload_speed = EXCLUDED.upload_speed,
        download_speed = EXCLUDED.download_speed",
    );
    qb
}

fn hourly_upsert(chunk: &[HourlyRollup]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO traffic_hourly (hour_start, client_id, delta_uploaded, delta_downloaded, avg_upload_speed, avg_download_speed, sample_count) ",
    );
    qb.push_values(chunk, |mut b, r| {
        b.push_bind(r.hour.naive_utc())
            .push_bind(r.client_id.clone())
            .push_bind(r.delta_uploaded)
            .push_bind(r.delta_downloaded)
            .push_bind(r.avg_upload_speed)
            .push_bind(r.avg_download_speed)
            .push_bind(r.sample_count);
    });
    qb.push(
        " ON CONFLICT (hour_start, client_id) DO UPDATE SET
        delta_uploaded = traffic_hourly.delta_uploaded + EXCLUDED.delta_uploaded,
        delta_downloaded = traffic_hourly.delta_downloaded + EXCLUDED.delta_downloaded,
        avg_upload_speed = (traffic_hourly.avg_upload_speed * traffic_hourly.sample_count + EXCLUDED.avg_upload_speed * EXCLUDED.sample_count) / (traffic_hourly.sample_count + EXCLUDED.sample_count),
        avg_download_speed = (traffic_hourly.avg_download_speed * traffic_hourly.sample_count + EXCLUDED.avg_download_speed * EXCLUDED.sample_count) / (traffic_hourly.sample_count + EXCLUDED.sample_count),
        sample_count = traffic_hourly.sample_count + EXCLUDED.sample_count",
    );
    qb
}

fn job_upsert(chunk: &[JobRecord]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO jobs (hash, name, save_path, size, progress, state, site, release_group, details, client_id, last_seen) ",
    );
    qb.push_values(chunk, |mut b, j| {
        b.push_bind(j.hash.clone())
            .push_bind(j.name.clone())
            .push_bind(j.save_path.clone())
            .push_bind(j.size)
            .push_bind(j.progress)
            .push_bind(j.state.clone())
            .push_bind(j.site.clone())
            .push_bind(j.group.clone())
            .push_bind(j.details.clone())
            .push_bind(j.client_id.clone())
            .push_bind(j.last_seen.naive_utc());
    });
    qb.push(
        " ON CONFLICT (hash) DO UPDATE SET
        name = EXCLUDED.name, save_path = EXCLUDED.save_path, size = EXCLUDED.size,
        progress = EXCLUDED.progress, state = EXCLUDED.state, site = EXCLUDED.site,
        release_group = EXCLUDED.release_group,
        details = CASE WHEN EXCLUDED.details IS NOT NULL AND EXCLUDED.details <> '' THEN EXCLUDED.details ELSE jobs.details END,
        client_id = EXCLUDED.client_id, last_seen = EXCLUDED.last_seen",
    );
    qb
}

fn upload_upsert(chunk: &[UploadStat]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("INSERT INTO job_uploads (hash, client_id, uploaded) ");
    qb.push_values(chunk, |mut b, u| {
        b.push_bind(u.hash.clone())
            .push_bind(u.client_id.clone())
            .push_bind(u.uploaded);
    });
    qb.push(" ON CONFLICT (hash, client_id) DO UPDATE SET uploaded = EXCLUDED.uploaded");
    qb
}

/// Keep only the last sample written for each `(timestamp, client)` key.
fn last_per_key(samples: &[Sample]) -> Vec<Sample> {
    let mut index: HashMap<(DateTime<Utc>, &str), usize> = HashMap::new();
    let mut out: Vec<Sample> = Vec::with_capacity(samples.len());
    for s in samples {
        match index.get(&(s.timestamp, s.client_id.as_str())) {
            Some(&i) => out[i] = s.clone(),
            None => {
                index.insert((s.timestamp, s.client_id.as_str()), out.len());
                out.push(s.clone());
            }
        }
    }
    out
}

fn sample_from_row(row: &PgRow) -> Result<Sample, sqlx::Error> {
    Ok(Sample {
        timestamp: utc(row.try_get("sampled_at")?),
        client_id: row.try_get("client_id")?,
        cumulative_uploaded: row.try_get("cumulative_uploaded")?,
        cumulative_downloaded: row.try_get("cumulative_downloaded")?,
        upload_speed: row.try_get("upload_speed")?,
        download_speed: row.try_get("download_speed")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<JobView, sqlx::Error> {
    Ok(JobView {
        record: JobRecord {
            hash: row.try_get("hash")?,
            name: row.try_get("name")?,
            save_path: row.try_get("save_path")?,
            size: row.try_get("size")?,
            progress: row.try_get("progress")?,
            state: row.try_get("state")?,
            site: row.try_get("site")?,
            group: row.try_get("release_group")?,
            details: row.try_get("details")?,
            client_id: row.try_get("client_id")?,
            last_seen: utc(row.try_get("last_seen")?),
            external_checked_at: row
                .try_get::<Option<NaiveDateTime>, _>("external_checked_at")?
                .map(utc),
        },
        total_uploaded: row.try_get("total_uploaded")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(secs: i64, ul: i64) -> Sample {
        Sample {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs),
            client_id: "c1".to_string(),
            cumulative_uploaded: ul,
            cumulative_downloaded: 0,
            upload_speed: 0,
            download_speed: 0,
        }
    }

    #[test]
    fn test_sample_upsert_numbers_placeholders() {
        let chunk = vec![sample(0, 1), sample(1, 2)];
        let qb = sample_upsert(&chunk);
        let sql = qb.sql();
        assert!(sql.contains("($1, $2, $3, $4, $5, $6), ($7, $8, $9, $10, $11, $12)"));
        assert!(sql.contains("ON CONFLICT (sampled_at, client_id)"));
    }

    #[test]
    fn test_hourly_upsert_weights_averages() {
        let rollups = rollup_samples(&[sample(0, 1), sample(10, 5)]);
        let qb = hourly_upsert(&rollups);
        let sql = qb.sql();
        assert!(sql.contains("traffic_hourly.avg_upload_speed * traffic_hourly.sample_count"));
        assert!(sql.contains("sample_count = traffic_hourly.sample_count + EXCLUDED.sample_count"));
    }

    #[test]
    fn test_job_upsert_keeps_details_and_check_time() {
        let job = JobRecord {
            hash: "h".to_string(),
            name: "n".to_string(),
            save_path: "/".to_string(),
            size: 1,
            progress: 50.0,
            state: "downloading".to_string(),
            site: None,
            group: None,
            details: None,
            client_id: "c1".to_string(),
            last_seen: Utc::now(),
            external_checked_at: None,
        };
        let qb = job_upsert(&[job]);
        let sql = qb.sql();
        assert!(sql.contains("ELSE jobs.details END"));
        assert!(!sql.contains("external_checked_at"));
    }

    #[test]
    fn test_last_per_key_keeps_latest_write() {
        let deduped = last_per_key(&[sample(0, 1), sample(1, 2), sample(0, 3)]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].cumulative_uploaded, 3);
        assert_eq!(deduped[1].cumulative_uploaded, 2);
    }
}
