//! Raw entity state to canonical reading.
//!
//! ```text
//! RawEntityState ─┬─ state ──────── parse f64 ── convert to canonical unit ─┐
//!                 ├─ device_class ─ reading type + default unit ────────────┤
//!                 ├─ entity_id ──── device id, location override ───────────┼─> CanonicalReading
//!                 └─ last_changed ─ unix seconds ───────────────────────────┘
//! ```
//!
//! Errors are per-reading: the offending state is dropped and the next
//! update for the same entity supersedes it.

use crate::config::LocationConfig;
use crate::model::{CanonicalReading, Measurement, RawEntityState, DATA_SOURCE};
use crate::reading_types;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Readings may run at most this far ahead of the local clock.
pub const FUTURE_TIMESTAMP_TOLERANCE_SECS: i64 = 30;

/// Upstream placeholder values for "no reading".
const SENTINEL_STATES: [&str; 3] = ["unavailable", "unknown", "none"];

/// Errors that drop a single reading.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("Entity {entity_id} is {state}")]
    Unavailable { entity_id: String, state: String },

    #[error("Entity {entity_id} has non-numeric value '{value}'")]
    NonNumeric { entity_id: String, value: String },

    #[error("Entity {entity_id} value {value} is out of range after conversion to {unit}")]
    OutOfRange {
        entity_id: String,
        value: String,
        unit: String,
    },

    #[error("Entity {entity_id} has no known reading type")]
    UnknownReadingType { entity_id: String },

    #[error("Reading for {device_id} is {ahead_secs}s in the future")]
    FutureTimestamp { device_id: String, ahead_secs: i64 },

    #[error("Reading for {device_id} has no location (0, 0)")]
    MissingLocation { device_id: String },
}

/// Result type for transformation.
pub type Result<T> = std::result::Result<T, TransformError>;

/// Lower-case and replace every character outside `[a-z0-9_]` with `_`.
pub fn sanitize_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Maps accepted entity states to canonical readings.
#[derive(Debug, Clone, Default)]
pub struct ReadingTransformer {
    node_name: Option<String>,
}

impl ReadingTransformer {
    /// Create a transformer. `node_name` prefixes every device id.
    pub fn new(node_name: Option<String>) -> Self {
        Self {
            node_name: node_name.filter(|name| !name.trim().is_empty()),
        }
    }

    /// Stable device id: `<source>_<node>_<entity>`, all sanitized.
    pub fn device_id(&self, entity_id: &str, node_override: Option<&str>) -> String {
        let source = DATA_SOURCE.to_ascii_lowercase();
        let node = node_override
            .filter(|name| !name.trim().is_empty())
            .or(self.node_name.as_deref());

        match node {
            Some(node) => format!(
                "{source}_{}_{}",
                sanitize_token(node),
                sanitize_token(entity_id)
            ),
            None => format!("{source}_{}", sanitize_token(entity_id)),
        }
    }

    /// Transform one entity state.
    pub fn transform(
        &self,
        state: &RawEntityState,
        locations: &LocationConfig,
    ) -> Result<CanonicalReading> {
        let raw = state.state.trim();
        if SENTINEL_STATES.contains(&raw.to_ascii_lowercase().as_str()) || raw.is_empty() {
            return Err(TransformError::Unavailable {
                entity_id: state.entity_id.clone(),
                state: state.state.clone(),
            });
        }

        let value = raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| TransformError::NonNumeric {
                entity_id: state.entity_id.clone(),
                value: state.state.clone(),
            })?;

        let declared_unit = state.unit();
        let kind = state
            .device_class
            .as_deref()
            .and_then(reading_types::for_device_class)
            .or_else(|| reading_types::infer(&state.entity_id, declared_unit))
            .ok_or_else(|| TransformError::UnknownReadingType {
                entity_id: state.entity_id.clone(),
            })?;

        // Known conversions land in the canonical unit, anything else keeps
        // the declared unit untouched
        let (value, unit) = match declared_unit {
            Some(declared) => match reading_types::convert(value, declared, kind.unit) {
                Some(converted) => (converted, kind.unit),
                None => (value, declared),
            },
            None => (value, kind.unit),
        };

        let value = reading_types::round_value(value);
        if !value.is_finite() {
            return Err(TransformError::OutOfRange {
                entity_id: state.entity_id.clone(),
                value: state.state.clone(),
                unit: unit.to_string(),
            });
        }

        let resolved = locations.resolve(&state.entity_id);
        let node_name = resolved
            .node_name
            .filter(|name| !name.trim().is_empty())
            .or(self.node_name.as_deref());
        let location = resolved.location;

        Ok(CanonicalReading {
            device_id: self.device_id(&state.entity_id, resolved.node_name),
            timestamp: state.last_changed.timestamp(),
            latitude: location.latitude,
            longitude: location.longitude,
            country_code: location.country_code.to_ascii_lowercase(),
            subdivision_code: location.subdivision_code.to_ascii_lowercase(),
            data_source: DATA_SOURCE.to_string(),
            measurements: vec![Measurement {
                reading_type: kind.reading_type.to_string(),
                value,
                unit: unit.to_string(),
            }],
            altitude: location.altitude,
            deployment_type: location.deployment_type,
            node_name: node_name.map(str::to_string),
        })
    }
}

/// Reject readings that are implausibly far in the future or unlocated.
pub fn validate_reading(reading: &CanonicalReading, now: DateTime<Utc>) -> Result<()> {
    let ahead_secs = reading.timestamp - now.timestamp();
    if ahead_secs > FUTURE_TIMESTAMP_TOLERANCE_SECS {
        return Err(TransformError::FutureTimestamp {
            device_id: reading.device_id.clone(),
            ahead_secs,
        });
    }

    if reading.latitude == 0.0 && reading.longitude == 0.0 {
        return Err(TransformError::MissingLocation {
            device_id: reading.device_id.clone(),
        });
    }

    Ok(())
}
