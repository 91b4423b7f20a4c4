//! Polling transport: periodic full-state fetch with snapshot diffing.

use crate::entities::HassEntityState;
use crate::transport::{Result, Transport};
use async_trait::async_trait;
use chrono::Utc;
use ingester_core::RawEntityState;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Source of full state snapshots.
#[async_trait]
pub trait StateFetcher: Send + Sync {
    async fn fetch_states(&self) -> Result<Vec<HassEntityState>>;
}

/// What counts as a change between two polls.
#[derive(Debug, Clone, PartialEq)]
struct Fingerprint {
    state: String,
    attributes: Map<String, Value>,
}

impl From<&HassEntityState> for Fingerprint {
    fn from(entity: &HassEntityState) -> Self {
        Self {
            state: entity.state.clone(),
            attributes: entity.attributes.clone(),
        }
    }
}

/// Polls the hub and reports only entities whose value or attributes
/// changed since the previous poll.
pub struct PollTransport<F> {
    fetcher: F,
    interval: Duration,
    snapshot: HashMap<String, Fingerprint>,
}

impl<F: StateFetcher> PollTransport<F> {
    pub fn new(fetcher: F, interval: Duration) -> Self {
        Self {
            fetcher,
            interval,
            snapshot: HashMap::new(),
        }
    }

    /// Replace the snapshot, returning the entities that changed.
    ///
    /// Entities missing from `current` are forgotten, so they are reported
    /// again if they reappear.
    fn diff(&mut self, current: Vec<HassEntityState>) -> Vec<HassEntityState> {
        let mut next = HashMap::with_capacity(current.len());
        let mut changed = Vec::new();

        for entity in current {
            let fingerprint = Fingerprint::from(&entity);
            if self.snapshot.get(&entity.entity_id) != Some(&fingerprint) {
                changed.push(entity.clone());
            }
            next.insert(entity.entity_id, fingerprint);
        }

        self.snapshot = next;
        changed
    }
}

fn into_raw(entities: Vec<HassEntityState>) -> Vec<RawEntityState> {
    let received_at = Utc::now();
    entities
        .into_iter()
        .map(|entity| entity.into_raw(received_at))
        .collect()
}

#[async_trait]
impl<F: StateFetcher> Transport for PollTransport<F> {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn connect(&mut self) -> Result<Vec<RawEntityState>> {
        let states = self.fetcher.fetch_states().await?;
        self.snapshot.clear();
        let all = self.diff(states);
        Ok(into_raw(all))
    }

    async fn next_batch(&mut self) -> Result<Vec<RawEntityState>> {
        tokio::time::sleep(self.interval).await;
        let states = self.fetcher.fetch_states().await?;
        let changed = self.diff(states);
        tracing::debug!(changed = changed.len(), "Poll complete");
        Ok(into_raw(changed))
    }

    async fn close(&mut self) {
        self.snapshot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str, state: &str, attributes: Value) -> HassEntityState {
        HassEntityState {
            entity_id: id.to_string(),
            state: state.to_string(),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            last_changed: None,
            last_updated: None,
        }
    }

    struct NoFetch;

    #[async_trait]
    impl StateFetcher for NoFetch {
        async fn fetch_states(&self) -> Result<Vec<HassEntityState>> {
            Ok(Vec::new())
        }
    }

    fn ids(entities: &[HassEntityState]) -> Vec<&str> {
        entities.iter().map(|e| e.entity_id.as_str()).collect()
    }

    #[test]
    fn test_first_diff_reports_everything() {
        let mut poll = PollTransport::new(NoFetch, Duration::from_secs(60));
        let changed = poll.diff(vec![
            entity("sensor.a", "1", json!({})),
            entity("sensor.b", "2", json!({})),
        ]);
        assert_eq!(ids(&changed), vec!["sensor.a", "sensor.b"]);
    }

    #[test]
    fn test_unchanged_entities_are_suppressed() {
        let mut poll = PollTransport::new(NoFetch, Duration::from_secs(60));
        poll.diff(vec![
            entity("sensor.a", "1", json!({"unit_of_measurement": "°C"})),
            entity("sensor.b", "2", json!({})),
        ]);

        let changed = poll.diff(vec![
            entity("sensor.a", "1", json!({"unit_of_measurement": "°C"})),
            entity("sensor.b", "3", json!({})),
        ]);
        assert_eq!(ids(&changed), vec!["sensor.b"]);
    }

    #[test]
    fn test_attribute_change_is_reported() {
        let mut poll = PollTransport::new(NoFetch, Duration::from_secs(60));
        poll.diff(vec![entity("sensor.a", "1", json!({"battery": 90}))]);

        let changed = poll.diff(vec![entity("sensor.a", "1", json!({"battery": 89}))]);
        assert_eq!(ids(&changed), vec!["sensor.a"]);
    }

    #[test]
    fn test_timestamp_only_change_is_suppressed() {
        let mut poll = PollTransport::new(NoFetch, Duration::from_secs(60));
        poll.diff(vec![entity("sensor.a", "1", json!({}))]);

        let mut touched = entity("sensor.a", "1", json!({}));
        touched.last_updated = Some("2024-10-27T03:40:00+00:00".to_string());
        assert!(poll.diff(vec![touched]).is_empty());
    }

    #[test]
    fn test_removed_entity_is_forgotten() {
        let mut poll = PollTransport::new(NoFetch, Duration::from_secs(60));
        poll.diff(vec![entity("sensor.a", "1", json!({}))]);
        poll.diff(Vec::new());

        let changed = poll.diff(vec![entity("sensor.a", "1", json!({}))]);
        assert_eq!(ids(&changed), vec!["sensor.a"]);
    }
}
