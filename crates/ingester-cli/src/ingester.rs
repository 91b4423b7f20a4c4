//! The pipeline owner: filter, transform, validate and enqueue.

use async_trait::async_trait;
use chrono::Utc;
use ingester_core::config::{Config, ConfigError};
use ingester_core::transformer::validate_reading;
use ingester_core::{
    FilterEngine, LocationConfig, RawEntityState, ReadingTransformer, StateHandler, TransformError,
};
use ingester_sinks::{topic_for, DrainReport, SinkBuffer};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    states_received: AtomicU64,
    filtered: AtomicU64,
    processed: AtomicU64,
    transform_failures: AtomicU64,
    future_timestamps: AtomicU64,
    missing_location: AtomicU64,
    enqueued: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub states_received: u64,
    /// Rejected by the filter engine
    pub filtered: u64,
    /// Transformed and validated
    pub processed: u64,
    /// Unavailable, non-numeric or of unknown type
    pub transform_failures: u64,
    pub future_timestamps: u64,
    pub missing_location: u64,
    /// Envelopes handed to the sink buffer
    pub enqueued: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            states_received: self.states_received.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            future_timestamps: self.future_timestamps.load(Ordering::Relaxed),
            missing_location: self.missing_location.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Owns every pipeline stage and receives states from the connection manager.
pub struct Ingester {
    filter: FilterEngine,
    transformer: ReadingTransformer,
    locations: LocationConfig,
    sinks: SinkBuffer,
    namespace: String,
    dry_run: bool,
    audited: AtomicBool,
    stats: IngestStats,
}

impl Ingester {
    pub fn new(config: &Config, sinks: SinkBuffer) -> Result<Self, ConfigError> {
        Ok(Self {
            filter: FilterEngine::from_config(&config.filters)?,
            transformer: ReadingTransformer::new(config.node_name.clone()),
            locations: config.location.clone(),
            sinks,
            namespace: config.output.mqtt.namespace.clone(),
            dry_run: config.dry_run,
            audited: AtomicBool::new(false),
            stats: IngestStats::default(),
        })
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn sinks(&self) -> &SinkBuffer {
        &self.sinks
    }

    /// Drain the sink queues and log the final counters.
    pub async fn shutdown(self) -> (IngestStatsSnapshot, DrainReport) {
        let stats = self.stats.snapshot();
        let report = self.sinks.shutdown().await;

        info!(
            states_received = stats.states_received,
            filtered = stats.filtered,
            processed = stats.processed,
            transform_failures = stats.transform_failures,
            future_timestamps = stats.future_timestamps,
            missing_location = stats.missing_location,
            enqueued = stats.enqueued,
            "Ingestion stopped"
        );
        for (sink, s) in &report.sinks {
            info!(
                sink = *sink,
                flushed = s.flushed,
                failed_flushes = s.failed_flushes,
                dropped_batches = s.dropped_batches,
                dropped_readings = s.dropped_readings,
                "Sink drained"
            );
        }

        (stats, report)
    }

    /// Warn about accepted entities that look like they came from another
    /// gateway. Runs once, on the first snapshot.
    fn audit(&self, states: &[RawEntityState]) {
        if self.audited.swap(true, Ordering::Relaxed) {
            return;
        }

        let suspicious = self.filter.suspicious_entities(states);
        if suspicious.is_empty() {
            debug!(entities = states.len(), "Entity audit found nothing suspicious");
            return;
        }
        for entity_id in &suspicious {
            warn!(
                entity_id = %entity_id,
                "Entity looks like a re-published gateway sensor; add it to exclude_entities if it is"
            );
        }
        warn!(count = suspicious.len(), "Possible feedback loop entities accepted");
    }

    async fn process(&self, state: RawEntityState) {
        bump(&self.stats.states_received);

        if !self.filter.should_accept(&state) {
            bump(&self.stats.filtered);
            return;
        }

        let reading = match self.transformer.transform(&state, &self.locations) {
            Ok(reading) => reading,
            Err(e) => {
                bump(&self.stats.transform_failures);
                debug!(entity_id = %state.entity_id, error = %e, "Reading skipped");
                return;
            }
        };

        if let Err(e) = validate_reading(&reading, Utc::now()) {
            match e {
                TransformError::FutureTimestamp { .. } => bump(&self.stats.future_timestamps),
                TransformError::MissingLocation { .. } => bump(&self.stats.missing_location),
                _ => bump(&self.stats.transform_failures),
            }
            warn!(entity_id = %state.entity_id, error = %e, "Reading rejected");
            return;
        }

        bump(&self.stats.processed);

        if self.dry_run {
            let payload = serde_json::to_string(&reading).unwrap_or_default();
            info!(
                topic = %topic_for(&self.namespace, &reading),
                payload = %payload,
                "Dry run: would publish"
            );
            return;
        }

        let envelopes = self.sinks.enqueue(reading).await;
        self.stats
            .enqueued
            .fetch_add(envelopes as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl StateHandler for Ingester {
    async fn handle_state(&self, state: RawEntityState) {
        self.process(state).await;
    }

    async fn handle_resync(&self, states: Vec<RawEntityState>) {
        self.audit(&states);
        for state in states {
            self.process(state).await;
        }
    }
}
