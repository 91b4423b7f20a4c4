//! Home Assistant state payloads.

use chrono::{DateTime, Utc};
use ingester_core::RawEntityState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Entity state as returned by `/api/states` and `state_changed` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HassEntityState {
    /// Entity ID (e.g., sensor.temperature_188)
    pub entity_id: String,

    /// Current state value
    pub state: String,

    /// Entity attributes
    #[serde(default)]
    pub attributes: Map<String, Value>,

    /// Last changed timestamp (RFC 3339)
    #[serde(default)]
    pub last_changed: Option<String>,

    /// Last updated timestamp (RFC 3339)
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl HassEntityState {
    /// Device class attribute, if set.
    pub fn device_class(&self) -> Option<&str> {
        self.attributes.get("device_class").and_then(Value::as_str)
    }

    /// When the value last changed, falling back to `last_updated`.
    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.last_changed
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.last_updated.as_deref().and_then(parse_timestamp))
    }

    /// Capture as a pipeline state. `received_at` is used only when the
    /// payload carries no usable timestamp.
    pub fn into_raw(self, received_at: DateTime<Utc>) -> RawEntityState {
        let last_changed = self.changed_at().unwrap_or_else(|| {
            tracing::debug!(
                entity_id = %self.entity_id,
                "No usable last_changed, using receipt time"
            );
            received_at
        });
        let device_class = self.device_class().map(str::to_string);

        RawEntityState {
            entity_id: self.entity_id,
            state: self.state,
            attributes: self.attributes,
            device_class,
            last_changed,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
