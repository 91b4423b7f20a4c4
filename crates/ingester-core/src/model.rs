//! Data model shared by every pipeline stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Constant tag identifying readings produced by this gateway.
pub const DATA_SOURCE: &str = "HOMEASSISTANT";

/// Attribute key carrying the entity's declared unit.
pub const UNIT_ATTRIBUTE: &str = "unit_of_measurement";

/// A single entity state as captured from the upstream hub.
///
/// Immutable once captured. It is dropped after it has been transformed
/// or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntityState {
    /// Entity identifier (e.g. `sensor.ecowitt_outdoor_temp`)
    pub entity_id: String,

    /// Current value, exactly as reported
    pub state: String,

    /// Entity attributes
    #[serde(default)]
    pub attributes: Map<String, Value>,

    /// Device class, lifted out of the attributes
    #[serde(default)]
    pub device_class: Option<String>,

    /// When the value last changed upstream
    pub last_changed: DateTime<Utc>,
}

impl RawEntityState {
    /// Create a state with no attributes.
    pub fn new(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        last_changed: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Map::new(),
            device_class: None,
            last_changed,
        }
    }

    /// Set the device class.
    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    /// Set the declared unit of measurement.
    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        self.with_attribute(UNIT_ATTRIBUTE, Value::String(unit.into()))
    }

    /// Add an arbitrary attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Domain part of the entity id (`sensor` for `sensor.foo`).
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.entity_id)
    }

    /// Declared unit of measurement, if any.
    pub fn unit(&self) -> Option<&str> {
        self.attributes
            .get(UNIT_ATTRIBUTE)
            .and_then(Value::as_str)
            .filter(|unit| !unit.is_empty())
    }
}

/// One typed value inside a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub reading_type: String,
    pub value: f64,
    pub unit: String,
}

/// Where a sensor is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentType {
    Indoor,
    Outdoor,
    Mixed,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indoor => "INDOOR",
            Self::Outdoor => "OUTDOOR",
            Self::Mixed => "MIXED",
        }
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INDOOR" => Ok(Self::Indoor),
            "OUTDOOR" => Ok(Self::Outdoor),
            "MIXED" => Ok(Self::Mixed),
            other => Err(format!(
                "invalid deployment type '{other}', expected INDOOR, OUTDOOR or MIXED"
            )),
        }
    }
}

/// The normalized reading shared by every ingestion gateway.
///
/// This is exactly the JSON payload published on the bus. The optional
/// trailing fields are omitted from the payload when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReading {
    pub device_id: String,
    /// Unix seconds of the upstream last-changed time
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub country_code: String,
    pub subdivision_code: String,
    pub data_source: String,
    pub measurements: Vec<Measurement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_type: Option<DeploymentType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl CanonicalReading {
    /// The reading's single measurement.
    pub fn measurement(&self) -> Option<&Measurement> {
        self.measurements.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_reading() -> CanonicalReading {
        CanonicalReading {
            device_id: "homeassistant_sensor_ecowitt_outdoor_temp".to_string(),
            timestamp: 1_730_000_000,
            latitude: -36.8485,
            longitude: 174.7633,
            country_code: "nz".to_string(),
            subdivision_code: "auk".to_string(),
            data_source: DATA_SOURCE.to_string(),
            measurements: vec![Measurement {
                reading_type: "temperature".to_string(),
                value: 18.3,
                unit: "°C".to_string(),
            }],
            altitude: None,
            deployment_type: Some(DeploymentType::Outdoor),
            node_name: None,
        }
    }

    #[test]
    fn test_domain_extraction() {
        let ts = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(RawEntityState::new("sensor.x", "1", ts).domain(), "sensor");
        assert_eq!(
            RawEntityState::new("binary_sensor.door", "on", ts).domain(),
            "binary_sensor"
        );
        assert_eq!(RawEntityState::new("nodot", "1", ts).domain(), "nodot");
    }

    #[test]
    fn test_unit_ignores_empty_attribute() {
        let ts = Utc.timestamp_opt(0, 0).unwrap();
        let state = RawEntityState::new("sensor.x", "1", ts).with_unit("");
        assert_eq!(state.unit(), None);

        let state = RawEntityState::new("sensor.x", "1", ts).with_unit("°C");
        assert_eq!(state.unit(), Some("°C"));
    }

    #[test]
    fn test_reading_json_shape() {
        let json = serde_json::to_value(sample_reading()).unwrap();

        assert_eq!(json["data_source"], "HOMEASSISTANT");
        assert_eq!(json["country_code"], "nz");
        assert_eq!(json["measurements"][0]["reading_type"], "temperature");
        assert_eq!(json["deployment_type"], "OUTDOOR");
        // Unset optional fields are left out of the payload
        assert!(json.get("altitude").is_none());
        assert!(json.get("node_name").is_none());
    }

    #[test]
    fn test_reading_round_trip() {
        let reading = sample_reading();
        let encoded = serde_json::to_string(&reading).unwrap();
        let decoded: CanonicalReading = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, reading);
    }

    #[test]
    fn test_deployment_type_parse() {
        assert_eq!("indoor".parse::<DeploymentType>(), Ok(DeploymentType::Indoor));
        assert_eq!("MIXED".parse::<DeploymentType>(), Ok(DeploymentType::Mixed));
        assert!("garage".parse::<DeploymentType>().is_err());
    }
}
