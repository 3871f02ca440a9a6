//! Reconciles the `jobs` table against the clients' current listings.

use crate::client::{ClientAdapter, RawJob};
use crate::config::EngineConfig;
use crate::db::{DbError, JobKey, JobRecord, ReconcilePlan, ReconcileSummary, Store, UploadStat};
use crate::directory::{extract_url_from_comment, normalize_state, Directory};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Why a stored job is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Its owner listed successfully and no client reports it any more.
    Vanished,
    /// Its owner is no longer configured at all.
    ClientRemoved,
}

/// Fate of a stored job row in one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Kept, and refreshed if some client listed it.
    Tracked,
    Removed(Removal),
    /// Marked by the user; never deleted.
    Protected,
}

/// What this pass learned from the clients.
#[derive(Debug, Default)]
pub struct Listing {
    /// Hashes reported by any client.
    pub current: HashSet<String>,
    /// Clients whose listing succeeded.
    pub listed: HashSet<String>,
    /// Every configured client, enabled or not.
    pub configured: HashSet<String>,
}

impl JobState {
    pub fn classify(key: &JobKey, listing: &Listing) -> JobState {
        if key.is_protected() {
            JobState::Protected
        } else if listing.current.contains(&key.hash) {
            JobState::Tracked
        } else if !listing.configured.contains(&key.client_id) {
            JobState::Removed(Removal::ClientRemoved)
        } else if listing.listed.contains(&key.client_id) {
            JobState::Removed(Removal::Vanished)
        } else {
            // Owner is disabled or failed to answer; leave its rows alone.
            JobState::Tracked
        }
    }
}

/// Completion ratio as a percentage with one decimal.
fn progress_percent(ratio: f64) -> f64 {
    (ratio * 1000.0).round() / 10.0
}

/// Attribute and normalise one listed job.
pub fn job_record(raw: &RawJob, client_id: &str, directory: &Directory, now: DateTime<Utc>) -> JobRecord {
    let site = directory.site_for(&raw.trackers, &raw.comment);
    let group = directory.group_for(&raw.name);
    if site.is_none() {
        if let Some(group_site) = group.as_deref().and_then(|g| directory.group_site(g)) {
            tracing::debug!(
                "Reconciler: no tracker match for {}; group belongs to {}",
                raw.hash,
                group_site
            );
        }
    }

    JobRecord {
        hash: raw.hash.clone(),
        name: raw.name.clone(),
        save_path: raw.save_path.clone(),
        size: raw.size,
        progress: progress_percent(raw.progress),
        state: normalize_state(&raw.state),
        site,
        group,
        details: extract_url_from_comment(&raw.comment),
        client_id: client_id.to_string(),
        last_seen: now,
        external_checked_at: None,
    }
}

/// Builds the write plan from listings and the stored keys.
#[derive(Default)]
pub struct PlanBuilder {
    listing: Listing,
    jobs: HashMap<String, JobRecord>,
    uploads: HashMap<(String, String), i64>,
}

impl PlanBuilder {
    pub fn new<'a>(configured: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            listing: Listing {
                configured: configured.into_iter().map(str::to_string).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Add one client's successful listing. A job listed by several clients
    /// is attributed to the one reporting the highest progress.
    pub fn add_listing(&mut self, client_id: &str, jobs: &[RawJob], directory: &Directory, now: DateTime<Utc>) {
        self.listing.listed.insert(client_id.to_string());

        for raw in jobs {
            if raw.hash.is_empty() {
                continue;
            }
            self.listing.current.insert(raw.hash.clone());

            if raw.uploaded > 0 {
                self.uploads.insert((raw.hash.clone(), client_id.to_string()), raw.uploaded);
            }

            let record = job_record(raw, client_id, directory, now);
            match self.jobs.get(&raw.hash) {
                Some(existing) if existing.progress >= record.progress => {}
                _ => {
                    self.jobs.insert(raw.hash.clone(), record);
                }
            }
        }
    }

    pub fn build(self, stored: &[JobKey]) -> ReconcilePlan {
        let mut vanished: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut removed_clients: Vec<String> = Vec::new();

        for key in stored {
            match JobState::classify(key, &self.listing) {
                JobState::Tracked | JobState::Protected => {}
                JobState::Removed(Removal::Vanished) => {
                    vanished.entry(key.client_id.clone()).or_default().push(key.hash.clone());
                }
                JobState::Removed(Removal::ClientRemoved) => {
                    if !removed_clients.contains(&key.client_id) {
                        removed_clients.push(key.client_id.clone());
                    }
                }
            }
        }

        let mut upserts: Vec<JobRecord> = self.jobs.into_values().collect();
        upserts.sort_by(|a, b| a.hash.cmp(&b.hash));

        let mut uploads: Vec<UploadStat> = self
            .uploads
            .into_iter()
            .map(|((hash, client_id), uploaded)| UploadStat { hash, client_id, uploaded })
            .collect();
        uploads.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.client_id.cmp(&b.client_id)));

        removed_clients.sort();

        ReconcilePlan {
            upserts,
            uploads,
            vanished: vanished.into_iter().collect(),
            removed_clients,
        }
    }
}

/// Periodic sync of job rows with what the clients report.
pub struct JobReconciler {
    store: Arc<dyn Store>,
    adapter: Arc<ClientAdapter>,
}

impl JobReconciler {
    pub fn new(store: Arc<dyn Store>, adapter: Arc<ClientAdapter>) -> Self {
        Self { store, adapter }
    }

    pub async fn run(&self, config: &EngineConfig) -> Result<ReconcileSummary, DbError> {
        let enabled: Vec<_> = config.enabled_clients().collect();
        if enabled.is_empty() {
            tracing::warn!("JobReconciler: no enabled clients, skipping");
            return Ok(ReconcileSummary::default());
        }

        let directory = Directory::from_sites(&self.store.get_sites().await?);
        if directory.is_empty() {
            tracing::debug!("JobReconciler: site directory is empty");
        }

        let now = Utc::now();
        let mut builder = PlanBuilder::new(config.downloaders.iter().map(|d| d.id.as_str()));
        for client in enabled {
            match self.adapter.list_jobs(client).await {
                Ok(jobs) => {
                    tracing::debug!("JobReconciler: '{}' listed {} jobs", client.name, jobs.len());
                    builder.add_listing(&client.id, &jobs, &directory, now);
                }
                Err(e) => {
                    tracing::warn!("JobReconciler: failed to list jobs on '{}': {}", client.name, e);
                }
            }
        }

        let stored = self.store.get_job_keys().await?;
        let plan = builder.build(&stored);
        let summary = self.store.apply_reconcile(&plan).await?;

        tracing::info!(
            "JobReconciler: {} jobs upserted, {} vanished and {} from removed clients deleted",
            summary.upserted,
            summary.vanished_deleted,
            summary.removed_client_deleted
        );
        if summary.orphan_uploads_deleted > 0 {
            tracing::debug!("JobReconciler: dropped {} orphaned upload totals", summary.orphan_uploads_deleted);
        }
        Ok(summary)
    }
}
