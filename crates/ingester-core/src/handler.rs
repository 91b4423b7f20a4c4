//! Seam between the upstream link and the rest of the pipeline.

use crate::model::RawEntityState;
use async_trait::async_trait;

/// Receives entity states from the connection manager.
///
/// Calls are made from a single ingestion task, in upstream order. An
/// implementation may suspend (e.g. on sink backpressure); the connection
/// manager does not read further upstream data until the call returns.
#[async_trait]
pub trait StateHandler: Send + Sync {
    /// Handle one incremental state change.
    async fn handle_state(&self, state: RawEntityState);

    /// Handle the full snapshot emitted after every (re)connect.
    async fn handle_resync(&self, states: Vec<RawEntityState>) {
        for state in states {
            self.handle_state(state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StateHandler for Recorder {
        async fn handle_state(&self, state: RawEntityState) {
            self.seen.lock().unwrap().push(state.entity_id);
        }
    }

    #[tokio::test]
    async fn test_default_resync_preserves_order() {
        let recorder = Recorder::default();
        let states = ["sensor.a", "sensor.b", "sensor.c"]
            .into_iter()
            .map(|id| RawEntityState::new(id, "1", Utc::now()))
            .collect();

        recorder.handle_resync(states).await;

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["sensor.a", "sensor.b", "sensor.c"]
        );
    }
}
