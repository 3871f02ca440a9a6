//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle value written by the external cross-seed matcher for jobs that
/// are known to exist elsewhere but are not present in any local client yet.
/// Rows carrying it are never removed by reconciliation.
pub const PROTECTED_STATE: &str = "未做种";

/// A point-in-time traffic reading for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub cumulative_uploaded: i64,
    pub cumulative_downloaded: i64,
    pub upload_speed: i64,
    pub download_speed: i64,
}

/// Hourly summary of raw samples for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRollup {
    pub hour: DateTime<Utc>,
    pub client_id: String,
    pub delta_uploaded: i64,
    pub delta_downloaded: i64,
    pub avg_upload_speed: f64,
    pub avg_download_speed: f64,
    pub sample_count: i64,
}

impl HourlyRollup {
    /// Fold `other` into `self` the way the stores merge a rollup into an
    /// existing row: deltas add up and averages are weighted by sample count.
    pub fn merge(&mut self, other: &HourlyRollup) {
        let total = self.sample_count + other.sample_count;
        if total > 0 {
            self.avg_upload_speed = (self.avg_upload_speed * self.sample_count as f64
                + other.avg_upload_speed * other.sample_count as f64)
                / total as f64;
            self.avg_download_speed = (self.avg_download_speed * self.sample_count as f64
                + other.avg_download_speed * other.sample_count as f64)
                / total as f64;
        }
        self.delta_uploaded += other.delta_uploaded;
        self.delta_downloaded += other.delta_downloaded;
        self.sample_count = total;
    }
}

/// Canonical record of one torrent as last reported by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub hash: String,
    pub name: String,
    pub save_path: String,
    pub size: i64,
    /// Completion percentage, one decimal place.
    pub progress: f64,
    pub state: String,
    pub site: Option<String>,
    pub group: Option<String>,
    pub details: Option<String>,
    pub client_id: String,
    pub last_seen: DateTime<Utc>,
    /// Maintained by the external matcher; never written by reconciliation.
    pub external_checked_at: Option<DateTime<Utc>>,
}

/// A job row together with its upload total summed over every client that
/// has seeded it.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub record: JobRecord,
    pub total_uploaded: i64,
}

/// Identity of an existing job row, as needed to plan reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKey {
    pub hash: String,
    pub client_id: String,
    pub state: String,
}

impl JobKey {
    pub fn is_protected(&self) -> bool {
        self.state == PROTECTED_STATE
    }
}

/// Per-`(hash, client)` uploaded counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStat {
    pub hash: String,
    pub client_id: String,
    pub uploaded: i64,
}

/// Everything one reconciliation pass writes, applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub upserts: Vec<JobRecord>,
    pub uploads: Vec<UploadStat>,
    /// `(client_id, hashes)` that vanished from that client's listing.
    pub vanished: Vec<(String, Vec<String>)>,
    /// Clients no longer present in configuration at all.
    pub removed_clients: Vec<String>,
}

/// Row counts produced by applying a [`ReconcilePlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub upserted: usize,
    pub uploads: usize,
    pub vanished_deleted: usize,
    pub removed_client_deleted: usize,
    pub orphan_uploads_deleted: usize,
}

/// Outcome of folding raw samples into hourly rollups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldSummary {
    pub rollups: usize,
    pub raw_deleted: usize,
}

/// A row of the site directory table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRow {
    pub nickname: String,
    pub base_url: String,
    pub special_tracker_domain: Option<String>,
    /// Comma separated release group aliases.
    pub groups: Option<String>,
}

/// Registry row for a configured client, including its startup baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub baseline_uploaded: i64,
    pub baseline_downloaded: i64,
    pub baseline_at: Option<DateTime<Utc>>,
}

/// Traffic totals for one UTC day and client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTraffic {
    pub day: chrono::NaiveDate,
    pub client_id: String,
    pub uploaded: i64,
    pub downloaded: i64,
}
