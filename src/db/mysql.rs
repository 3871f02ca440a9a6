//! MySQL store implementation.

use super::models::*;
use super::rollup::rollup_samples;
use super::store::{migration_statements, utc, DbError, Dialect, Store, DELETE_ORPHAN_UPLOADS, MAX_ROWS_PER_STATEMENT};
use crate::config::ClientConfig;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{Connection, MySql, MySqlConnection, QueryBuilder, Row};

const SELECT_JOBS: &str = "SELECT j.hash, j.name, j.save_path, j.size, j.progress, j.state, j.site,
    j.release_group, j.details, j.client_id, j.last_seen, j.external_checked_at,
    CAST(COALESCE((SELECT SUM(u.uploaded) FROM job_uploads u WHERE u.hash = j.hash), 0) AS SIGNED) AS total_uploaded
    FROM jobs j";

/// MySQL store. Each call opens a connection and closes it when done.
#[derive(Debug, Clone)]
pub struct MysqlStore {
    url: String,
}

impl MysqlStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn connect(&self) -> Result<MySqlConnection, DbError> {
        Ok(MySqlConnection::connect(&self.url).await?)
    }
}

#[async_trait]
impl Store for MysqlStore {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn migrate(&self) -> Result<(), DbError> {
        let mut conn = self.connect().await?;
        for stmt in migration_statements(include_str!("../../migrations/mysql/000001_init.up.sql")) {
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

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        for chunk in samples.chunks(MAX_ROWS_PER_STATEMENT) {
            sample_upsert(chunk).build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        conn.close().await?;

        // MySQL reports 2 affected rows per updated duplicate, so count inputs.
        Ok(samples.len())
    }

    async fn get_raw_samples(
        &self,
        client_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, DbError> {
        let mut qb = QueryBuilder::<MySql>::new(
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
        let mut qb = QueryBuilder::<MySql>::new(
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

        // FOR UPDATE takes gap locks on the range, so no sample can be
        // inserted below the cutoff until this transaction ends.
        let rows = sqlx::query(
            "SELECT sampled_at, client_id, cumulative_uploaded, cumulative_downloaded, upload_speed, download_speed
             FROM traffic_raw WHERE sampled_at < ? ORDER BY sampled_at ASC FOR UPDATE",
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

        let deleted = sqlx::query("DELETE FROM traffic_raw WHERE sampled_at < ?")
            .bind(cutoff.naive_utc())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        conn.close().await?;

        Ok(FoldSummary {
            rollups: rollups.len(),
            raw_deleted: deleted.rows_affected() as usize,
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
                "INSERT INTO clients (id, name, kind) VALUES (?, ?, ?)
                 ON DUPLICATE KEY UPDATE name = VALUES(name), kind = VALUES(kind)",
            )
            .bind(&c.id)
            .bind(&c.name)
            .bind(c.kind.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let mut qb = QueryBuilder::<MySql>::new("DELETE FROM clients WHERE id NOT IN (");
        push_in_list(&mut qb, clients.iter().map(|c| c.id.clone()));
        qb.build().execute(&mut *tx).await?;

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
            "UPDATE clients SET baseline_uploaded = ?, baseline_downloaded = ?, baseline_at = ? WHERE id = ?",
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
            "INSERT INTO sites (nickname, base_url, special_tracker_domain, group_aliases) VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE base_url = VALUES(base_url),
             special_tracker_domain = VALUES(special_tracker_domain), group_aliases = VALUES(group_aliases)",
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
            for chunk in hashes.chunks(MAX_ROWS_PER_STATEMENT) {
                let mut qb = QueryBuilder::<MySql>::new("DELETE FROM jobs WHERE client_id = ");
                qb.push_bind(client_id.clone())
                    .push(" AND state <> ")
                    .push_bind(PROTECTED_STATE)
                    .push(" AND hash IN (");
                push_in_list(&mut qb, chunk.iter().cloned());
                summary.vanished_deleted += qb.build().execute(&mut *tx).await?.rows_affected() as usize;
            }
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
            let mut qb = QueryBuilder::<MySql>::new("DELETE FROM jobs WHERE state <> ");
            qb.push_bind(PROTECTED_STATE).push(" AND client_id IN (");
            push_in_list(&mut qb, plan.removed_clients.iter().cloned());
            summary.removed_client_deleted = qb.build().execute(&mut *tx).await?.rows_affected() as usize;
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
        let mut qb = QueryBuilder::<MySql>::new(SELECT_JOBS);
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
        let row = sqlx::query(&format!("{} WHERE j.hash = ?", SELECT_JOBS))
            .bind(hash)
            .fetch_optional(&mut conn)
            .await?;
        conn.close().await?;

        Ok(row.as_ref().map(job_from_row).transpose()?)
    }
}

/// Push `v1, v2, ...)` as bound values; the caller has already pushed `(`.
fn push_in_list(qb: &mut QueryBuilder<'static, MySql>, values: impl Iterator<Item = String>) {
    let mut sep = qb.separated(", ");
    for v in values {
        sep.push_bind(v);
    }
    sep.push_unseparated(")");
}

fn sample_upsert(chunk: &[Sample]) -> QueryBuilder<'static, MySql> {
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
        " ON DUPLICATE KEY UPDATE
        cumulative_uploaded = VALUES(cumulative_uploaded),
        cumulative_downloaded = VALUES(cumulative_downloaded),
        upload_speed = VALUES(upload_speed),
        download_speed = VALUES(download_speed)",
    );
    qb
}

fn hourly_upsert(chunk: &[HourlyRollup]) -> QueryBuilder<'static, MySql> {
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
    // Assignments apply left to right; sample_count must be updated last so
    // the averages are weighted by the stored count.
    qb.push(
        " ON DUPLICATE KEY UPDATE
        avg_upload_speed = (avg_upload_speed * sample_count + VALUES(avg_upload_speed) * VALUES(sample_count)) / (sample_count + VALUES(sample_count)),
        avg_download_speed = (avg_download_speed * sample_count + VALUES(avg_download_speed) * VALUES(sample_count)) / (sample_count + VALUES(sample_count)),
        delta_uploaded = delta_uploaded + VALUES(delta_uploaded),
        delta_downloaded = delta_downloaded + VALUES(delta_downloaded),
        sample_count = sample_count + VALUES(sample_count)",
    );
    qb
}

fn job_upsert(chunk: &[JobRecord]) -> QueryBuilder<'static, MySql> {
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
        " ON DUPLICATE KEY UPDATE
        name = VALUES(name), save_path = VALUES(save_path), size = VALUES(size),
        progress = VALUES(progress), state = VALUES(state), site = VALUES(site),
        release_group = VALUES(release_group),
        details = IF(VALUES(details) IS NOT NULL AND VALUES(details) <> '', VALUES(details), details),
        client_id = VALUES(client_id), last_seen = VALUES(last_seen)",
    );
    qb
}

fn upload_upsert(chunk: &[UploadStat]) -> QueryBuilder<'static, MySql> {
    let mut qb = QueryBuilder::new("INSERT INTO job_uploads (hash, client_id, uploaded) ");
    qb.push_values(chunk, |mut b, u| {
        b.push_bind(u.hash.clone())
            .push_bind(u.client_id.clone())
            .push_bind(u.uploaded);
    });
    qb.push(" ON DUPLICATE KEY UPDATE uploaded = VALUES(uploaded)");
    qb
}

fn sample_from_row(row: &MySqlRow) -> Result<Sample, sqlx::Error> {
    Ok(Sample {
        timestamp: utc(row.try_get("sampled_at")?),
        client_id: row.try_get("client_id")?,
        cumulative_uploaded: row.try_get("cumulative_uploaded")?,
        cumulative_downloaded: row.try_get("cumulative_downloaded")?,
        upload_speed: row.try_get("upload_speed")?,
        download_speed: row.try_get("download_speed")?,
    })
}

fn job_from_row(row: &MySqlRow) -> Result<JobView, sqlx::Error> {
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
