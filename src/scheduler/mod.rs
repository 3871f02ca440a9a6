//! Scheduler module driving polling, job reconciliation and aggregation.
//!
//! One background task owns every stage and runs them strictly in sequence:
//! each poll cycle reads every enabled client into the [`SampleBuffer`] and
//! flushes full batches through the [`SampleWriter`]; on a slower cadence the
//! [`JobReconciler`] runs; on the slowest the [`Aggregator`] folds old samples.

mod buffer;
mod reconcile;
mod rollup;
mod writer;

pub use buffer::*;
pub use reconcile::*;
pub use rollup::*;
pub use writer::*;

use crate::client::ClientAdapter;
use crate::config::{ConfigSource, EngineConfig};
use crate::db::{Sample, Store};

use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Pause between start and the first poll.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// The engine's single background loop.
pub struct Scheduler {
    store: Arc<dyn Store>,
    source: Arc<dyn ConfigSource>,
    config: EngineConfig,
    adapter: Arc<ClientAdapter>,
    buffer: Arc<SampleBuffer>,
    writer: SampleWriter,
    settle_delay: Duration,
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    stop_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the loop to stop after its current step.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait for the loop to finish its final flush. Returns `false` if it did
    /// not finish within `timeout`.
    pub async fn join(self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("Scheduler: task failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("Scheduler: did not stop within {:?}", timeout);
                false
            }
        }
    }
}

/// Stop side of the broadcast channel. Once a stop is seen it stays seen, so
/// a check that consumes the message cannot hide it from later ones.
struct StopSignal {
    rx: broadcast::Receiver<()>,
    stopped: bool,
}

impl StopSignal {
    fn new(rx: broadcast::Receiver<()>) -> Self {
        Self { rx, stopped: false }
    }

    /// True once a stop has been sent or the sender is gone.
    fn requested(&mut self) -> bool {
        if !self.stopped {
            self.stopped = !matches!(self.rx.try_recv(), Err(TryRecvError::Empty));
        }
        self.stopped
    }

    /// Resolves when a stop arrives, or at once if one already has.
    async fn wait(&mut self) {
        if !self.stopped {
            let _ = self.rx.recv().await;
            self.stopped = true;
        }
    }
}

impl Scheduler {
    /// `config` is the snapshot loaded at startup; `buffer` must be sized for
    /// its poll interval and is shared with the read API.
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn ConfigSource>,
        config: EngineConfig,
        buffer: Arc<SampleBuffer>,
    ) -> Self {
        Self {
            writer: SampleWriter::new(store.clone()),
            store,
            source,
            config,
            adapter: Arc::new(ClientAdapter::new()),
            buffer,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.writer = SampleWriter::with_policy(self.store.clone(), policy);
        self
    }

    /// Spawn the loop.
    pub fn start(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(StopSignal::new(stop_rx)));
        SchedulerHandle { stop_tx, task }
    }

    async fn run(mut self, mut stop: StopSignal) {
        let poll = self.config.poll_interval();
        tracing::info!(
            "Scheduler: starting with {} enabled clients, polling every {:?}",
            self.config.enabled_clients().count(),
            poll
        );

        tokio::select! {
            _ = stop.wait() => {
                tracing::info!("Scheduler: stopped before first poll");
                return;
            }
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        self.sync_clients().await;
        if !stop.requested() {
            self.record_baselines(&mut stop).await;
        }
        if !stop.requested() {
            self.reconcile().await;
        }
        if stop.requested() {
            self.shutdown().await;
            return;
        }

        let reconcile_every = Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        let aggregate_every = Duration::from_secs(self.config.aggregation_interval_secs.max(1));
        let mut last_reconcile = Instant::now();
        let mut last_aggregate = Instant::now();

        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.wait() => break,
                _ = interval.tick() => {}
            }

            if !self.poll_clients(&mut stop).await {
                break;
            }

            match self.buffer.drain_if_full() {
                Some(batch) => self.writer.submit(batch).await,
                None => self.writer.write_due().await,
            }

            if last_reconcile.elapsed() >= reconcile_every {
                if stop.requested() {
                    break;
                }
                self.reload_config().await;
                self.reconcile().await;
                last_reconcile = Instant::now();
            }

            if last_aggregate.elapsed() >= aggregate_every {
                if stop.requested() {
                    break;
                }
                if let Err(e) = Aggregator::new(self.store.clone()).run(self.config.retention_hours).await {
                    tracing::error!("Scheduler: aggregation failed: {}", e);
                }
                last_aggregate = Instant::now();
            }
        }

        self.shutdown().await;
    }

    /// Read every enabled client once. Returns `false` if a stop arrived
    /// part way through.
    async fn poll_clients(&self, stop: &mut StopSignal) -> bool {
        let now = Utc::now().trunc_subsecs(6);

        for client in self.config.enabled_clients() {
            if stop.requested() {
                return false;
            }
            match self.adapter.get_counters(client).await {
                Ok(c) => {
                    self.buffer.record(Sample {
                        timestamp: now,
                        client_id: client.id.clone(),
                        cumulative_uploaded: c.cumulative_uploaded,
                        cumulative_downloaded: c.cumulative_downloaded,
                        upload_speed: c.upload_speed,
                        download_speed: c.download_speed,
                    });
                }
                Err(e) => {
                    tracing::warn!("Scheduler: failed to poll '{}': {}", client.name, e);
                }
            }
        }
        true
    }

    async fn sync_clients(&self) {
        if let Err(e) = self.store.sync_clients(&self.config.downloaders).await {
            tracing::error!("Scheduler: failed to sync client registry: {}", e);
        }
    }

    async fn record_baselines(&self, stop: &mut StopSignal) {
        let now = Utc::now().trunc_subsecs(6);

        for client in self.config.enabled_clients() {
            if stop.requested() {
                return;
            }
            let counters = match self.adapter.get_counters(client).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Scheduler: no baseline for '{}': {}", client.name, e);
                    continue;
                }
            };
            match self.writer.write_baseline(&client.id, counters, now).await {
                Ok(()) => tracing::info!(
                    "Scheduler: baseline for '{}' at {} up / {} down",
                    client.name,
                    counters.cumulative_uploaded,
                    counters.cumulative_downloaded
                ),
                Err(e) => tracing::error!("Scheduler: failed to write baseline for '{}': {}", client.name, e),
            }
        }
    }

    async fn reload_config(&mut self) {
        match self.source.load() {
            Ok(config) => {
                if config.poll_interval() != self.config.poll_interval() {
                    tracing::warn!("Scheduler: poll interval changes take effect after a restart");
                }
                if config.downloaders != self.config.downloaders {
                    tracing::info!("Scheduler: client list changed");
                    self.config = config;
                    self.sync_clients().await;
                } else {
                    self.config = config;
                }
            }
            Err(e) => {
                tracing::error!("Scheduler: failed to reload config, keeping previous: {}", e);
            }
        }
    }

    async fn reconcile(&self) {
        if self.config.enabled_clients().next().is_none() {
            tracing::warn!("Scheduler: no enabled clients configured");
        }

        // Sessions are rebuilt at the slow cadence rather than reused.
        self.adapter.clear();

        let reconciler = JobReconciler::new(self.store.clone(), self.adapter.clone());
        if let Err(e) = reconciler.run(&self.config).await {
            tracing::error!("Scheduler: job reconciliation failed: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        let remaining = self.buffer.flush();
        tracing::info!("Scheduler: stopping, flushing {} buffered samples", remaining.len());

        if !remaining.is_empty() {
            self.writer.submit(remaining).await;
        }
        self.writer.flush_all().await;

        if self.writer.dropped_samples() > 0 {
            tracing::error!("Scheduler: {} samples were dropped this run", self.writer.dropped_samples());
        }
    }
}
