//! Per-sink bounded queues with batching, retry and a bounded drain.
//!
//! ```text
//!                    ┌─> [queue: bus]   ──> drain task ──> BusPublisher
//! enqueue(reading) ──┤
//!                    └─> [queue: store] ──> drain task ──> StoreWriter
//! ```
//!
//! A drain task flushes when `batch_size` readings are queued or when
//! `flush_interval` has passed since the oldest one was enqueued, whichever
//! comes first. Batches are flushed one at a time and retried in place, so
//! readings reach each sink in the order they were enqueued.

use crate::sink::Sink;
use ingester_core::config::BufferConfig;
use ingester_core::CanonicalReading;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One reading bound for one sink.
#[derive(Debug, Clone)]
pub struct SinkEnvelope {
    pub reading: CanonicalReading,
    pub sink: &'static str,
    pub enqueued_at: Instant,
}

/// Counters for one sink.
#[derive(Debug, Default)]
pub struct SinkStats {
    enqueued: AtomicU64,
    flushed: AtomicU64,
    failed_flushes: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_readings: AtomicU64,
    pending: AtomicU64,
}

/// Point-in-time copy of [`SinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStatsSnapshot {
    pub enqueued: u64,
    /// Readings written successfully
    pub flushed: u64,
    /// Flush attempts that returned an error, retries included
    pub failed_flushes: u64,
    pub dropped_batches: u64,
    pub dropped_readings: u64,
    /// Enqueued but neither flushed nor dropped yet
    pub pending: u64,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            dropped_readings: self.dropped_readings.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    fn record_flushed(&self, readings: usize) {
        self.flushed.fetch_add(readings as u64, Ordering::Relaxed);
        self.pending.fetch_sub(readings as u64, Ordering::Relaxed);
    }

    fn record_dropped(&self, readings: usize) {
        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
        self.dropped_readings.fetch_add(readings as u64, Ordering::Relaxed);
        self.pending.fetch_sub(readings as u64, Ordering::Relaxed);
    }

    /// Count everything still pending as dropped.
    fn abandon_pending(&self) -> u64 {
        let pending = self.pending.swap(0, Ordering::Relaxed);
        self.dropped_readings.fetch_add(pending, Ordering::Relaxed);
        pending
    }
}

/// A sink plus its queue settings.
pub struct SinkRegistration {
    pub sink: Arc<dyn Sink>,
    pub config: BufferConfig,
    /// Disabled sinks get no queue and never see an envelope
    pub enabled: bool,
}

impl SinkRegistration {
    pub fn new(sink: Arc<dyn Sink>, config: BufferConfig) -> Self {
        Self {
            sink,
            config,
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

struct SinkQueue {
    name: &'static str,
    tx: mpsc::Sender<SinkEnvelope>,
    stats: Arc<SinkStats>,
    task: JoinHandle<()>,
}

/// Outcome of [`SinkBuffer::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sinks: Vec<(&'static str, SinkStatsSnapshot)>,
    /// Whether the drain deadline was hit
    pub timed_out: bool,
}

impl DrainReport {
    /// Readings dropped across all sinks over the process lifetime.
    pub fn dropped_readings(&self) -> u64 {
        self.sinks.iter().map(|(_, s)| s.dropped_readings).sum()
    }
}

/// Fans readings out to one bounded queue per enabled sink.
pub struct SinkBuffer {
    queues: Vec<SinkQueue>,
    drain: CancellationToken,
    drain_timeout: Duration,
}

impl SinkBuffer {
    /// Spawn one drain task per enabled sink.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(registrations: Vec<SinkRegistration>, drain_timeout: Duration) -> Self {
        let drain = CancellationToken::new();
        let mut queues = Vec::new();

        for registration in registrations {
            let name = registration.sink.name();
            if !registration.enabled {
                info!(sink = name, "Sink disabled");
                continue;
            }

            let (tx, rx) = mpsc::channel(registration.config.capacity.max(1));
            let stats = Arc::new(SinkStats::default());
            let worker = DrainWorker {
                sink: registration.sink,
                config: registration.config,
                stats: stats.clone(),
                drain: drain.clone(),
            };
            info!(
                sink = name,
                capacity = worker.config.capacity,
                batch_size = worker.config.batch_size,
                flush_interval_secs = worker.config.flush_interval_secs,
                "Sink queue started"
            );
            let task = tokio::spawn(worker.run(rx));

            queues.push(SinkQueue {
                name,
                tx,
                stats,
                task,
            });
        }

        Self {
            queues,
            drain,
            drain_timeout,
        }
    }

    /// Names of the sinks that receive envelopes.
    pub fn sink_names(&self) -> Vec<&'static str> {
        self.queues.iter().map(|q| q.name).collect()
    }

    /// Start draining: stop waiting on full queues and cut retries to zero.
    ///
    /// Readings that would have to wait for queue space from now on are
    /// dropped and counted. Queued readings are still flushed.
    pub fn begin_drain(&self) {
        if !self.drain.is_cancelled() {
            info!("Sink drain started");
        }
        self.drain.cancel();
    }

    /// Queue a reading for every enabled sink.
    ///
    /// Waits while a sink's queue is full, unless a drain has started.
    /// Returns the number of envelopes created.
    pub async fn enqueue(&self, reading: CanonicalReading) -> usize {
        let enqueued_at = Instant::now();
        let mut created = 0;

        for queue in &self.queues {
            let envelope = SinkEnvelope {
                reading: reading.clone(),
                sink: queue.name,
                enqueued_at,
            };

            queue.stats.pending.fetch_add(1, Ordering::Relaxed);
            let sent = tokio::select! {
                biased;
                sent = queue.tx.send(envelope) => sent.is_ok(),
                _ = self.drain.cancelled() => {
                    warn!(sink = queue.name, "Sink queue full while draining, reading dropped");
                    false
                }
            };
            if !sent {
                queue.stats.pending.fetch_sub(1, Ordering::Relaxed);
                queue.stats.dropped_readings.fetch_add(1, Ordering::Relaxed);
                if !self.drain.is_cancelled() {
                    error!(sink = queue.name, "Sink queue closed, reading dropped");
                }
                continue;
            }
            queue.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            created += 1;
        }

        created
    }

    /// Current counters per sink.
    pub fn stats(&self) -> Vec<(&'static str, SinkStatsSnapshot)> {
        self.queues
            .iter()
            .map(|q| (q.name, q.stats.snapshot()))
            .collect()
    }

    /// Stop accepting readings and flush what is queued.
    ///
    /// Retries are cut to zero. Whatever has not been written when the
    /// drain timeout expires is dropped and counted.
    pub async fn shutdown(self) -> DrainReport {
        self.begin_drain();

        let mut workers = Vec::with_capacity(self.queues.len());
        for queue in self.queues {
            drop(queue.tx);
            workers.push((queue.name, queue.stats, queue.task));
        }

        let all_done = async {
            for (name, _, task) in workers.iter_mut() {
                if let Err(e) = task.await {
                    error!(sink = *name, error = %e, "Drain task failed");
                }
            }
        };
        let timed_out = tokio::time::timeout(self.drain_timeout, all_done)
            .await
            .is_err();

        let mut report = DrainReport {
            sinks: Vec::with_capacity(workers.len()),
            timed_out,
        };
        for (name, stats, task) in workers {
            if !task.is_finished() {
                task.abort();
                // The worker must be gone before its pending count is settled
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        error!(sink = name, error = %e, "Drain task failed");
                    }
                }
            }
            let abandoned = stats.abandon_pending();
            if abandoned > 0 {
                warn!(
                    sink = name,
                    dropped = abandoned,
                    "Drain deadline reached, readings dropped"
                );
            }
            report.sinks.push((name, stats.snapshot()));
        }

        report
    }
}

struct DrainWorker {
    sink: Arc<dyn Sink>,
    config: BufferConfig,
    stats: Arc<SinkStats>,
    drain: CancellationToken,
}

impl DrainWorker {
    async fn run(self, mut rx: mpsc::Receiver<SinkEnvelope>) {
        let name = self.sink.name();
        let batch_size = self.config.batch_size.max(1);
        let flush_interval = Duration::from_secs(self.config.flush_interval_secs);

        let mut batch: Vec<CanonicalReading> = Vec::with_capacity(batch_size);
        // Flush deadline, set by the oldest reading in the batch
        let mut deadline: Option<Instant> = None;

        loop {
            let received = match deadline {
                Some(at) => tokio::select! {
                    biased;
                    envelope = rx.recv() => Some(envelope),
                    _ = tokio::time::sleep_until(at) => None,
                },
                None => Some(rx.recv().await),
            };

            match received {
                Some(Some(envelope)) => {
                    if batch.is_empty() {
                        deadline = Some(envelope.enqueued_at + flush_interval);
                    }
                    batch.push(envelope.reading);
                    if batch.len() >= batch_size {
                        self.flush(std::mem::take(&mut batch)).await;
                        deadline = None;
                    }
                }
                // Every sender dropped: shutting down
                Some(None) => {
                    if !batch.is_empty() {
                        self.flush(std::mem::take(&mut batch)).await;
                    }
                    break;
                }
                None => {
                    self.flush(std::mem::take(&mut batch)).await;
                    deadline = None;
                }
            }
        }

        self.sink.close().await;
        debug!(sink = name, "Drain task finished");
    }

    /// Write a batch, retrying with backoff, and drop it when retries run out.
    async fn flush(&self, batch: Vec<CanonicalReading>) {
        let name = self.sink.name();
        let mut attempt: u32 = 0;

        loop {
            match self.sink.flush(&batch).await {
                Ok(()) => {
                    debug!(sink = name, readings = batch.len(), "Batch flushed");
                    self.stats.record_flushed(batch.len());
                    return;
                }
                Err(e) => {
                    self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);

                    if self.drain.is_cancelled() || attempt >= self.config.max_retries {
                        warn!(
                            sink = name,
                            readings = batch.len(),
                            attempts = attempt + 1,
                            error = %e,
                            "Flush failed, batch dropped"
                        );
                        self.stats.record_dropped(batch.len());
                        return;
                    }

                    attempt += 1;
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        sink = name,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Flush failed, retrying"
                    );

                    // Shutdown cuts the wait short for one last attempt
                    tokio::select! {
                        biased;
                        _ = self.drain.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
