//! Persists drained sample batches, retrying failed writes with backoff.

use crate::client::Counters;
use crate::db::{DbError, Sample, Store};

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Backoff schedule for batches whose write failed.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A batch is dropped after this many failed attempts.
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` failed ones, jitter
    /// excluded.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(1 << exp).min(self.max_delay)
    }

    fn jittered(&self, failures: u32) -> Duration {
        let base = self.delay_after(failures);
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }
}

struct PendingBatch {
    samples: Vec<Sample>,
    failures: u32,
    retry_at: Instant,
}

/// Writes batches in the order they were submitted. A batch that fails is
/// held back, together with everything submitted after it, until its retry
/// time comes round.
pub struct SampleWriter {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    queue: VecDeque<PendingBatch>,
    dropped: u64,
}

impl SampleWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            queue: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Batches waiting to be written.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Samples discarded after exhausting their retries.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped
    }

    /// Queue a batch and write whatever is due.
    pub async fn submit(&mut self, samples: Vec<Sample>) {
        if !samples.is_empty() {
            self.queue.push_back(PendingBatch {
                samples,
                failures: 0,
                retry_at: Instant::now(),
            });
        }
        self.write_due().await;
    }

    /// Write queued batches front to back until one fails or is not yet due.
    pub async fn write_due(&mut self) {
        while let Some(front) = self.queue.front_mut() {
            if front.retry_at > Instant::now() {
                return;
            }

            match self.store.upsert_samples(&front.samples).await {
                Ok(n) => {
                    tracing::debug!("SampleWriter: wrote {} samples", n);
                    self.queue.pop_front();
                }
                Err(e) => {
                    front.failures += 1;
                    if front.failures >= self.policy.max_attempts {
                        tracing::error!(
                            "SampleWriter: dropping {} samples after {} failed attempts: {}",
                            front.samples.len(),
                            front.failures,
                            e
                        );
                        self.dropped += front.samples.len() as u64;
                        self.queue.pop_front();
                        continue;
                    }

                    let delay = self.policy.jittered(front.failures);
                    tracing::warn!(
                        "SampleWriter: failed to write {} samples (attempt {}), retrying in {:?}: {}",
                        front.samples.len(),
                        front.failures,
                        delay,
                        e
                    );
                    front.retry_at = Instant::now() + delay;
                    return;
                }
            }
        }
    }

    /// Final attempt at every queued batch, ignoring retry times.
    pub async fn flush_all(&mut self) {
        while let Some(batch) = self.queue.pop_front() {
            if let Err(e) = self.store.upsert_samples(&batch.samples).await {
                tracing::error!("SampleWriter: lost {} samples at shutdown: {}", batch.samples.len(), e);
                self.dropped += batch.samples.len() as u64;
            }
        }
    }

    /// Record a client's startup counters and anchor its series with a
    /// zero-speed sample, so the first hour's delta starts from here.
    pub async fn write_baseline(
        &self,
        client_id: &str,
        counters: Counters,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.store
            .record_baseline(client_id, counters.cumulative_uploaded, counters.cumulative_downloaded, at)
            .await?;

        let anchor = Sample {
            timestamp: at,
            client_id: client_id.to_string(),
            cumulative_uploaded: counters.cumulative_uploaded,
            cumulative_downloaded: counters.cumulative_downloaded,
            upload_speed: 0,
            download_speed: 0,
        };
        self.store.upsert_samples(std::slice::from_ref(&anchor)).await?;
        Ok(())
    }
}
