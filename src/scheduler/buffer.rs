//! In-memory sample buffer shared by the poll loop and the read API.

use crate::db::Sample;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Batches are sized so a full one accumulates in about this long.
pub const TARGET_FLUSH_PERIOD: Duration = Duration::from_secs(60);

/// Number of poll cycles per flushed batch for the given poll interval.
pub fn batch_size_for(poll_interval: Duration) -> usize {
    let poll = poll_interval.as_secs().max(1);
    ((TARGET_FLUSH_PERIOD.as_secs() / poll) as usize).max(1)
}

#[derive(Default)]
struct Inner {
    pending: Vec<Sample>,
    cycles: usize,
    last_cycle: Option<DateTime<Utc>>,
    last_seen: HashMap<String, DateTime<Utc>>,
    recent: HashMap<String, VecDeque<Sample>>,
}

/// Pending samples plus a short per-client ring of recent ones.
///
/// Every method holds the lock only for the copy or append.
pub struct SampleBuffer {
    batch_size: usize,
    inner: Mutex<Inner>,
}

impl SampleBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn for_poll_interval(poll_interval: Duration) -> Self {
        Self::new(batch_size_for(poll_interval))
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sample. Samples must arrive with strictly increasing
    /// timestamps per client; anything else is refused and `false` returned.
    pub fn record(&self, sample: Sample) -> bool {
        let mut inner = self.lock();

        if let Some(last) = inner.last_seen.get(&sample.client_id) {
            if sample.timestamp <= *last {
                tracing::debug!(
                    "SampleBuffer: dropping out-of-order sample for {} at {}",
                    sample.client_id,
                    sample.timestamp
                );
                return false;
            }
        }
        inner.last_seen.insert(sample.client_id.clone(), sample.timestamp);

        // A batch counts poll cycles, not samples, so its size does not
        // depend on how many clients answered.
        if inner.last_cycle.map_or(true, |t| sample.timestamp > t) {
            inner.cycles += 1;
            inner.last_cycle = Some(sample.timestamp);
        }

        let capacity = self.batch_size;
        let ring = inner.recent.entry(sample.client_id.clone()).or_default();
        if ring.len() == capacity {
            ring.pop_front();
        }
        ring.push_back(sample.clone());

        inner.pending.push(sample);
        true
    }

    /// Take the pending batch once it spans `batch_size` poll cycles.
    pub fn drain_if_full(&self) -> Option<Vec<Sample>> {
        let mut inner = self.lock();
        if inner.cycles < self.batch_size {
            return None;
        }
        inner.cycles = 0;
        Some(std::mem::take(&mut inner.pending))
    }

    /// Take whatever is pending, full batch or not.
    pub fn flush(&self) -> Vec<Sample> {
        let mut inner = self.lock();
        inner.cycles = 0;
        std::mem::take(&mut inner.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Copy of the recent ring, ordered by time then client.
    pub fn snapshot(&self) -> Vec<Sample> {
        let inner = self.lock();
        let mut samples: Vec<Sample> = inner.recent.values().flatten().cloned().collect();
        drop(inner);

        samples.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.client_id.cmp(&b.client_id)));
        samples
    }

    /// Most recent sample of every client, ordered by client id.
    pub fn latest(&self) -> Vec<Sample> {
        let inner = self.lock();
        let mut samples: Vec<Sample> = inner.recent.values().filter_map(|r| r.back().cloned()).collect();
        drop(inner);

        samples.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        samples
    }
}
