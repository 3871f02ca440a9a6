//! Folds aged raw samples into hourly rollups.

use crate::db::{truncate_to_hour, DbError, FoldSummary, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

/// Raw samples from the last this-many calendar days are never folded,
/// whatever the configured retention.
pub const SAFETY_FLOOR_DAYS: i64 = 3;

/// Oldest instant whose raw samples must be kept.
///
/// The earlier of `now - retention_hours` and UTC midnight
/// `SAFETY_FLOOR_DAYS` days back, truncated to the hour so a bucket is never
/// split between two folds.
pub fn aggregation_cutoff(now: DateTime<Utc>, retention_hours: i64) -> DateTime<Utc> {
    let floor = (now - ChronoDuration::days(SAFETY_FLOOR_DAYS))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now);

    // Retention reaching past the epoch keeps every sample.
    let by_retention = ChronoDuration::try_hours(retention_hours.max(0))
        .and_then(|d| now.checked_sub_signed(d))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |dt| dt.max(DateTime::<Utc>::UNIX_EPOCH));

    truncate_to_hour(by_retention.min(floor))
}

/// Periodic fold of raw samples into `traffic_hourly`.
pub struct Aggregator {
    store: Arc<dyn Store>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn run(&self, retention_hours: i64) -> Result<FoldSummary, DbError> {
        self.run_at(Utc::now(), retention_hours).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>, retention_hours: i64) -> Result<FoldSummary, DbError> {
        let cutoff = aggregation_cutoff(now, retention_hours);
        let summary = self.store.fold_into_hourly(cutoff).await?;

        if summary.raw_deleted > 0 {
            tracing::info!(
                "Aggregator: folded {} raw samples into {} hourly rows (cutoff {})",
                summary.raw_deleted,
                summary.rollups,
                cutoff
            );
        } else {
            tracing::debug!("Aggregator: nothing older than {}", cutoff);
        }
        Ok(summary)
    }
}
