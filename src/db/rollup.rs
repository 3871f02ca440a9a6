//! Hour bucketing shared by every store dialect.
//!
//! The stores select raw rows and write rollups; the arithmetic lives here so
//! SQLite, PostgreSQL and MySQL produce identical buckets.

use super::models::{DailyTraffic, HourlyRollup, Sample};

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

const HOUR_SECONDS: i64 = 3600;

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

/// Truncate a datetime to the start of its hour.
pub fn truncate_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_window(dt, HOUR_SECONDS)
}

#[derive(Default)]
struct Bucket {
    min_ul: Option<i64>,
    max_ul: Option<i64>,
    min_dl: Option<i64>,
    max_dl: Option<i64>,
    sum_ul_speed: f64,
    sum_dl_speed: f64,
    count: i64,
}

impl Bucket {
    fn add(&mut self, s: &Sample) {
        self.min_ul = Some(self.min_ul.map_or(s.cumulative_uploaded, |v| v.min(s.cumulative_uploaded)));
        self.max_ul = Some(self.max_ul.map_or(s.cumulative_uploaded, |v| v.max(s.cumulative_uploaded)));
        self.min_dl = Some(self.min_dl.map_or(s.cumulative_downloaded, |v| v.min(s.cumulative_downloaded)));
        self.max_dl = Some(self.max_dl.map_or(s.cumulative_downloaded, |v| v.max(s.cumulative_downloaded)));
        self.sum_ul_speed += s.upload_speed as f64;
        self.sum_dl_speed += s.download_speed as f64;
        self.count += 1;
    }

    fn delta_uploaded(&self) -> i64 {
        spread(self.min_ul, self.max_ul)
    }

    fn delta_downloaded(&self) -> i64 {
        spread(self.min_dl, self.max_dl)
    }
}

fn spread(min: Option<i64>, max: Option<i64>) -> i64 {
    match (min, max) {
        (Some(min), Some(max)) => (max - min).max(0),
        _ => 0,
    }
}

/// Group samples by `(hour, client)` and summarise each group.
///
/// Deltas are the spread of the cumulative counters within the bucket and are
/// never negative; averages are plain means over the bucket's samples.
pub fn rollup_samples(samples: &[Sample]) -> Vec<HourlyRollup> {
    let mut buckets: BTreeMap<(DateTime<Utc>, &str), Bucket> = BTreeMap::new();
    for s in samples {
        buckets
            .entry((truncate_to_hour(s.timestamp), s.client_id.as_str()))
            .or_default()
            .add(s);
    }

    buckets
        .into_iter()
        .map(|((hour, client_id), b)| HourlyRollup {
            hour,
            client_id: client_id.to_string(),
            delta_uploaded: b.delta_uploaded(),
            delta_downloaded: b.delta_downloaded(),
            avg_upload_speed: b.sum_ul_speed / b.count as f64,
            avg_download_speed: b.sum_dl_speed / b.count as f64,
            sample_count: b.count,
        })
        .collect()
}

/// Per-day traffic totals over a mix of rollups (completed, folded hours) and
/// raw samples (everything not folded yet). Day boundaries are UTC.
pub fn daily_totals(hourly: &[HourlyRollup], raw: &[Sample]) -> Vec<DailyTraffic> {
    let mut days: BTreeMap<(NaiveDate, String), (i64, i64)> = BTreeMap::new();

    for r in hourly {
        let entry = days.entry((r.hour.date_naive(), r.client_id.clone())).or_default();
        entry.0 += r.delta_uploaded;
        entry.1 += r.delta_downloaded;
    }

    let mut raw_days: BTreeMap<(NaiveDate, &str), Bucket> = BTreeMap::new();
    for s in raw {
        raw_days
            .entry((s.timestamp.date_naive(), s.client_id.as_str()))
            .or_default()
            .add(s);
    }
    for ((day, client_id), b) in raw_days {
        let entry = days.entry((day, client_id.to_string())).or_default();
        entry.0 += b.delta_uploaded();
        entry.1 += b.delta_downloaded();
    }

    days.into_iter()
        .map(|((day, client_id), (uploaded, downloaded))| DailyTraffic {
            day,
            client_id,
            uploaded,
            downloaded,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample(ts: DateTime<Utc>, client: &str, ul: i64, dl: i64, speed: i64) -> Sample {
        Sample {
            timestamp: ts,
            client_id: client.to_string(),
            cumulative_uploaded: ul,
            cumulative_downloaded: dl,
            upload_speed: speed,
            download_speed: speed * 2,
        }
    }

    #[test]
    fn test_truncate_to_hour() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(truncate_to_hour(dt), Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert_eq!(
            truncate_to_window(dt, 300),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_rollup_groups_by_hour_and_client() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let samples = vec![
            sample(t0, "c1", 1000, 10, 4),
            sample(t0 + Duration::seconds(500), "c1", 1500, 30, 8),
            sample(t0 + Duration::seconds(10), "c2", 7, 7, 1),
            sample(t0 + Duration::hours(1), "c1", 1600, 40, 2),
        ];

        let rollups = rollup_samples(&samples);
        assert_eq!(rollups.len(), 3);

        let first = &rollups[0];
        assert_eq!(first.client_id, "c1");
        assert_eq!(first.hour, t0);
        assert_eq!(first.delta_uploaded, 500);
        assert_eq!(first.delta_downloaded, 20);
        assert_eq!(first.sample_count, 2);
        assert!((first.avg_upload_speed - 6.0).abs() < 1e-9);
        assert!((first.avg_download_speed - 12.0).abs() < 1e-9);

        assert_eq!(rollups[1].client_id, "c2");
        assert_eq!(rollups[1].delta_uploaded, 0);
        assert_eq!(rollups[2].hour, t0 + Duration::hours(1));
    }

    #[test]
    fn test_rollup_delta_never_negative_after_reset() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let samples = vec![
            sample(t0, "c1", 5000, 5000, 0),
            sample(t0 + Duration::seconds(60), "c1", 0, 0, 0),
            sample(t0 + Duration::seconds(120), "c1", 100, 50, 0),
        ];

        for r in rollup_samples(&samples) {
            assert!(r.delta_uploaded >= 0);
            assert!(r.delta_downloaded >= 0);
        }
    }

    #[test]
    fn test_daily_totals_combines_rollups_and_raw() {
        let day = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        let hourly = vec![HourlyRollup {
            hour: day + Duration::hours(2),
            client_id: "c1".to_string(),
            delta_uploaded: 400,
            delta_downloaded: 40,
            avg_upload_speed: 0.0,
            avg_download_speed: 0.0,
            sample_count: 10,
        }];
        let raw = vec![
            sample(day + Duration::hours(20), "c1", 1000, 100, 0),
            sample(day + Duration::hours(21), "c1", 1250, 160, 0),
            sample(day + Duration::hours(25), "c1", 1300, 170, 0),
        ];

        let totals = daily_totals(&hourly, &raw);
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].day, day.date_naive());
        assert_eq!(totals[0].uploaded, 650);
        assert_eq!(totals[0].downloaded, 100);
        // A lone sample on the next day carries no delta.
        assert_eq!(totals[1].uploaded, 0);
    }
}
