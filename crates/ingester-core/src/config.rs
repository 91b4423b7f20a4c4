//! Configuration loading for the ingester.
//!
//! Sources, applied in order:
//! 1. `config.toml` (path from `--config`, `CONFIG_PATH` or the default)
//! 2. `${VAR}` placeholders inside the file, expanded from the environment
//! 3. Well-known environment overrides (`HA_URL`, `CLICKHOUSE_URL`, ...)
//!
//! The result is loaded once at startup and never mutated afterwards.

use crate::backoff::Backoff;
use crate::filter::FilterEngine;
use crate::model::DeploymentType;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Environment variable names understood by [`Config::apply_env_overrides`].
pub mod env_vars {
    pub const CONFIG_PATH: &str = "CONFIG_PATH";
    pub const HA_URL: &str = "HA_URL";
    pub const HA_ACCESS_TOKEN: &str = "HA_ACCESS_TOKEN";
    pub const MQTT_BROKER: &str = "LOCAL_MQTT_BROKER";
    pub const MQTT_PORT: &str = "LOCAL_MQTT_PORT";
    pub const MQTT_USERNAME: &str = "LOCAL_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "LOCAL_MQTT_PASSWORD";
    pub const CLICKHOUSE_URL: &str = "CLICKHOUSE_URL";
    pub const CLICKHOUSE_USER: &str = "CLICKHOUSE_USER";
    pub const CLICKHOUSE_PASSWORD: &str = "CLICKHOUSE_PASSWORD";
    pub const CLICKHOUSE_DATABASE: &str = "CLICKHOUSE_DATABASE";
    pub const CLICKHOUSE_TABLE: &str = "CLICKHOUSE_TABLE";
    pub const DISABLE_CLICKHOUSE: &str = "DISABLE_CLICKHOUSE";
    pub const NODE_NAME: &str = "NODE_NAME";
    pub const DRY_RUN: &str = "DRY_RUN";
}

/// Errors raised while loading or validating configuration.
///
/// All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid entity pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub homeassistant: HomeAssistantConfig,
    /// Upstream reconnect backoff
    pub reconnect: Backoff,
    pub filters: FiltersConfig,
    pub location: LocationConfig,
    pub output: OutputConfig,
    pub shutdown: ShutdownConfig,
    /// Prefix for device ids, unique per ingester instance
    pub node_name: Option<String>,
    /// Log readings instead of writing them to any sink
    pub dry_run: bool,
}

/// How the upstream hub is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// `state_changed` subscription over the WebSocket API
    #[default]
    #[serde(alias = "event_stream")]
    WebSocket,
    /// Periodic full-state fetch over REST
    Polling,
}

/// Upstream hub connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    /// Base URL, e.g. `http://homeassistant.local:8123`
    #[serde(default)]
    pub url: String,

    /// Long-lived access token
    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub mode: TransportMode,

    /// Poll interval in seconds (polling mode)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// REST request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Interval between keep-alive pings (websocket mode)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Silence after which the link is considered dead (websocket mode)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            access_token: String::new(),
            mode: TransportMode::default(),
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            verify_ssl: true,
        }
    }
}

impl HomeAssistantConfig {
    /// REST API base, e.g. `http://host:8123/api`.
    pub fn api_base(&self) -> String {
        format!("{}/api", self.url.trim_end_matches('/'))
    }

    /// WebSocket endpoint derived from the base URL.
    pub fn websocket_url(&self) -> String {
        let url = self.url.trim_end_matches('/');
        let url = if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url.to_string()
        };
        format!("{url}/api/websocket")
    }
}

/// Whether unlisted entities are accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    Denylist,
    Allowlist,
}

/// Entity filter rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    pub mode: FilterMode,
    /// Only entities in these domains are ingested (empty = all)
    pub include_domains: Vec<String>,
    /// Device class allow-list (empty = no gate)
    pub include_device_classes: Vec<String>,
    /// Extra regexes, checked after the built-in loop-prevention pattern
    pub exclude_entity_patterns: Vec<String>,
    /// Exact entity ids to reject
    pub exclude_entities: Vec<String>,
    /// Allowlist entries, `*` matches any run of characters
    pub include_entities: Vec<String>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::Denylist,
            include_domains: vec!["sensor".to_string(), "binary_sensor".to_string()],
            include_device_classes: Vec::new(),
            exclude_entity_patterns: Vec::new(),
            exclude_entities: Vec::new(),
            include_entities: Vec::new(),
        }
    }
}

/// A physical location.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// ISO 3166-1 alpha-2, lower case in topics
    pub country_code: String,
    /// ISO 3166-2 subdivision, lower case in topics
    pub subdivision_code: String,
    pub deployment_type: Option<DeploymentType>,
}

/// Location for a single entity, falling back to the default per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationOverride {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub subdivision_code: Option<String>,
    #[serde(default)]
    pub deployment_type: Option<DeploymentType>,
    /// Node name used for this entity's device id
    #[serde(default)]
    pub node_name: Option<String>,
}

/// Default location plus per-entity overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub default: Location,
    /// Keyed by entity id
    pub overrides: BTreeMap<String, LocationOverride>,
}

/// Location resolved for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation<'a> {
    pub location: Location,
    pub node_name: Option<&'a str>,
    pub overridden: bool,
}

impl LocationConfig {
    /// Create a config with only a default location.
    pub fn with_default(default: Location) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    /// Add a per-entity override.
    pub fn with_override(mut self, entity_id: impl Into<String>, o: LocationOverride) -> Self {
        self.overrides.insert(entity_id.into(), o);
        self
    }

    /// Location for an entity: its override if present, else the default.
    pub fn resolve(&self, entity_id: &str) -> ResolvedLocation<'_> {
        match self.overrides.get(entity_id) {
            Some(o) => ResolvedLocation {
                location: Location {
                    latitude: o.latitude,
                    longitude: o.longitude,
                    altitude: o.altitude.or(self.default.altitude),
                    country_code: o
                        .country_code
                        .clone()
                        .unwrap_or_else(|| self.default.country_code.clone()),
                    subdivision_code: o
                        .subdivision_code
                        .clone()
                        .unwrap_or_else(|| self.default.subdivision_code.clone()),
                    deployment_type: o.deployment_type.or(self.default.deployment_type),
                },
                node_name: o.node_name.as_deref(),
                overridden: true,
            },
            None => ResolvedLocation {
                location: self.default.clone(),
                node_name: None,
                overridden: false,
            },
        }
    }
}

/// Per-sink queue, batching and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bounded queue size; a full queue blocks the producer
    pub capacity: usize,
    /// Flush as soon as this many readings are queued
    pub batch_size: usize,
    /// Flush at the latest this long after the oldest queued reading
    pub flush_interval_secs: u64,
    /// Retries after the first failed flush before the batch is dropped
    pub max_retries: u32,
    pub retry: Backoff,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            batch_size: 100,
            flush_interval_secs: 10,
            max_retries: 3,
            retry: Backoff {
                initial_delay_ms: 500,
                max_delay_ms: 10_000,
                ..Default::default()
            },
        }
    }
}

impl BufferConfig {
    /// Bus defaults: publish every reading as it arrives.
    pub fn bus_default() -> Self {
        Self {
            batch_size: 1,
            flush_interval_secs: 1,
            ..Default::default()
        }
    }
}

/// A buffer table as written, before defaults are applied.
#[derive(Debug, Default, Deserialize)]
struct BufferTable {
    capacity: Option<usize>,
    batch_size: Option<usize>,
    flush_interval_secs: Option<u64>,
    max_retries: Option<u32>,
    retry: Option<Backoff>,
}

impl BufferTable {
    fn over(self, base: BufferConfig) -> BufferConfig {
        BufferConfig {
            capacity: self.capacity.unwrap_or(base.capacity),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            flush_interval_secs: self.flush_interval_secs.unwrap_or(base.flush_interval_secs),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            retry: self.retry.unwrap_or(base.retry),
        }
    }
}

/// Missing bus buffer fields take the bus defaults, not the store ones.
fn deserialize_bus_buffer<'de, D>(deserializer: D) -> std::result::Result<BufferConfig, D::Error>
where
    D: Deserializer<'de>,
{
    BufferTable::deserialize(deserializer).map(|table| table.over(BufferConfig::bus_default()))
}

/// Output sinks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub mqtt: MqttOutputConfig,
    pub clickhouse: ClickHouseOutputConfig,
}

/// Publish/subscribe bus output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttOutputConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mqtt_broker")]
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// First topic segment, `<namespace>/decoded/...`
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(
        default = "BufferConfig::bus_default",
        deserialize_with = "deserialize_bus_buffer"
    )]
    pub buffer: BufferConfig,
}

fn default_mqtt_broker() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "hass-ingester-output".to_string()
}

fn default_namespace() -> String {
    "wesense".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

impl Default for MqttOutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broker: default_mqtt_broker(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            namespace: default_namespace(),
            keep_alive_secs: default_keep_alive(),
            buffer: BufferConfig::bus_default(),
        }
    }
}

/// Columnar store output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseOutputConfig {
    pub enabled: bool,
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table: String,
    pub buffer: BufferConfig,
}

impl Default for ClickHouseOutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:8123".to_string(),
            user: "default".to_string(),
            password: String::new(),
            database: "default".to_string(),
            table: "sensor_readings".to_string(),
            buffer: BufferConfig::default(),
        }
    }
}

/// Shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Hard deadline for draining sink queues
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Parse TOML, expanding `${VAR}` placeholders with `lookup`.
    pub fn from_toml_with<F>(content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let expanded = expand_env_vars(content, lookup);
        Ok(toml::from_str(&expanded)?)
    }

    /// Parse TOML, expanding placeholders from the process environment.
    pub fn from_toml(content: &str) -> Result<Self> {
        Self::from_toml_with(content, |name| std::env::var(name).ok())
    }

    /// Read and parse a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load a config file and apply the process environment on top.
    ///
    /// A missing file at the default path is not an error: the ingester can
    /// run from environment variables alone.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(env_vars::CONFIG_PATH).ok().map(PathBuf::from);
        let explicit = path.map(Path::to_path_buf).or(env_path);

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    tracing::info!(
                        path = DEFAULT_CONFIG_PATH,
                        "No config file found, using defaults and environment"
                    );
                    Self::default()
                }
            }
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply the well-known environment overrides.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(url) = get(env_vars::HA_URL) {
            self.homeassistant.url = url;
        }
        if let Some(token) = get(env_vars::HA_ACCESS_TOKEN) {
            self.homeassistant.access_token = token;
        }

        if let Some(broker) = get(env_vars::MQTT_BROKER) {
            self.output.mqtt.broker = broker;
        }
        if let Some(port) = get(env_vars::MQTT_PORT) {
            self.output.mqtt.port = port
                .parse()
                .map_err(|_| ConfigError::invalid(env_vars::MQTT_PORT, format!("'{port}' is not a port")))?;
        }
        if let Some(username) = get(env_vars::MQTT_USERNAME) {
            self.output.mqtt.username = Some(username);
        }
        if let Some(password) = get(env_vars::MQTT_PASSWORD) {
            self.output.mqtt.password = Some(password);
        }

        let store = &mut self.output.clickhouse;
        if let Some(url) = get(env_vars::CLICKHOUSE_URL) {
            store.url = url;
        }
        if let Some(user) = get(env_vars::CLICKHOUSE_USER) {
            store.user = user;
        }
        if let Some(password) = get(env_vars::CLICKHOUSE_PASSWORD) {
            store.password = password;
        }
        if let Some(database) = get(env_vars::CLICKHOUSE_DATABASE) {
            store.database = database;
        }
        if let Some(table) = get(env_vars::CLICKHOUSE_TABLE) {
            store.table = table;
        }
        if get(env_vars::DISABLE_CLICKHOUSE).is_some_and(|v| is_truthy(&v)) {
            store.enabled = false;
        }

        if let Some(node_name) = get(env_vars::NODE_NAME) {
            self.node_name = Some(node_name);
        }
        if get(env_vars::DRY_RUN).is_some_and(|v| is_truthy(&v)) {
            self.dry_run = true;
        }

        Ok(())
    }

    /// Whether envelopes are created for the bus sink.
    pub fn bus_enabled(&self) -> bool {
        !self.dry_run && self.output.mqtt.enabled
    }

    /// Whether envelopes are created for the store sink.
    pub fn store_enabled(&self) -> bool {
        !self.dry_run && self.output.clickhouse.enabled
    }

    /// Check the configuration, returning non-fatal warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let ha = &self.homeassistant;

        if ha.url.trim().is_empty() {
            return Err(ConfigError::MissingField("homeassistant.url"));
        }
        if !(ha.url.starts_with("http://") || ha.url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "homeassistant.url",
                format!("'{}' must start with http:// or https://", ha.url),
            ));
        }
        if ha.access_token.trim().is_empty() {
            return Err(ConfigError::MissingField("homeassistant.access_token"));
        }
        if ha.mode == TransportMode::Polling && ha.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "homeassistant.poll_interval_secs",
                "must be greater than zero",
            ));
        }
        if ha.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "homeassistant.heartbeat_interval_secs",
                "must be greater than zero",
            ));
        }
        if ha.heartbeat_timeout_secs <= ha.heartbeat_interval_secs {
            return Err(ConfigError::invalid(
                "homeassistant.heartbeat_timeout_secs",
                "must be longer than heartbeat_interval_secs",
            ));
        }

        validate_backoff("reconnect", &self.reconnect)?;
        validate_buffer("output.mqtt.buffer", &self.output.mqtt.buffer)?;
        validate_buffer("output.clickhouse.buffer", &self.output.clickhouse.buffer)?;

        // Compiles every pattern
        FilterEngine::from_config(&self.filters)?;

        validate_location("location.default", &self.location.default)?;
        for (entity_id, o) in &self.location.overrides {
            validate_coordinates(&format!("location.overrides.{entity_id}"), o.latitude, o.longitude)?;
        }

        let default = &self.location.default;
        if default.latitude == 0.0 && default.longitude == 0.0 {
            warnings.push(
                "Default location is (0, 0); readings without an override will be rejected"
                    .to_string(),
            );
        }
        if default.country_code.is_empty() || default.subdivision_code.is_empty() {
            warnings.push("Default location has no country or subdivision code".to_string());
        }
        if self.filters.mode == FilterMode::Allowlist && self.filters.include_entities.is_empty() {
            warnings.push("Allowlist mode with no include_entities: nothing will be ingested".to_string());
        }
        if self.filters.exclude_entity_patterns.is_empty() {
            warnings.push(
                "No exclude_entity_patterns configured; only the built-in loop-prevention pattern applies"
                    .to_string(),
            );
        }
        if self.dry_run {
            warnings.push("Dry run enabled: no data will be written to any sink".to_string());
        }

        Ok(warnings)
    }
}

fn validate_backoff(field: &str, backoff: &Backoff) -> Result<()> {
    if backoff.multiplier < 1.0 {
        return Err(ConfigError::invalid(
            format!("{field}.multiplier"),
            "must be at least 1.0",
        ));
    }
    if !(0.0..1.0).contains(&backoff.jitter) {
        return Err(ConfigError::invalid(
            format!("{field}.jitter"),
            "must be in [0, 1)",
        ));
    }
    if backoff.initial_delay_ms > backoff.max_delay_ms {
        return Err(ConfigError::invalid(
            format!("{field}.initial_delay_ms"),
            "must not exceed max_delay_ms",
        ));
    }
    Ok(())
}

fn validate_buffer(field: &str, buffer: &BufferConfig) -> Result<()> {
    if buffer.capacity == 0 {
        return Err(ConfigError::invalid(format!("{field}.capacity"), "must be greater than zero"));
    }
    if buffer.batch_size == 0 {
        return Err(ConfigError::invalid(format!("{field}.batch_size"), "must be greater than zero"));
    }
    validate_backoff(&format!("{field}.retry"), &buffer.retry)
}

fn validate_location(field: &str, location: &Location) -> Result<()> {
    validate_coordinates(field, location.latitude, location.longitude)
}

fn validate_coordinates(field: &str, latitude: f64, longitude: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(ConfigError::invalid(
            format!("{field}.latitude"),
            format!("{latitude} is out of range"),
        ));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(ConfigError::invalid(
            format!("{field}.longitude"),
            format!("{longitude} is out of range"),
        ));
    }
    Ok(())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Replace `${VAR}` placeholders. Unset variables expand to nothing.
pub fn expand_env_vars<F>(content: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let placeholder = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    placeholder
        .replace_all(content, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const MINIMAL_TOML: &str = r#"
[homeassistant]
url = "http://homeassistant.local:8123"
access_token = "token"

[location.default]
latitude = -36.8485
longitude = 174.7633
country_code = "nz"
subdivision_code = "auk"
"#;

    const FULL_TOML: &str = r#"
node_name = "kitchen-pi"
dry_run = false

[homeassistant]
url = "https://ha.example.com/"
access_token = "${TEST_HA_TOKEN}"
mode = "polling"
poll_interval_secs = 15

[reconnect]
initial_delay_ms = 250
max_delay_ms = 4000

[filters]
mode = "allowlist"
include_domains = ["sensor"]
include_device_classes = ["temperature", "humidity"]
exclude_entity_patterns = [".*_test_.*"]
include_entities = ["sensor.ecowitt_*"]

[location.default]
latitude = -36.8485
longitude = 174.7633
country_code = "nz"
subdivision_code = "auk"
deployment_type = "OUTDOOR"

[location.overrides."sensor.office_temp"]
latitude = -41.2865
longitude = 174.7762
subdivision_code = "wgn"
deployment_type = "INDOOR"
node_name = "office"

[output.mqtt]
broker = "mqtt.local"
namespace = "testnet"

[output.mqtt.buffer]
capacity = 50
batch_size = 5
flush_interval_secs = 10

[output.clickhouse]
enabled = false
table = "readings"

[shutdown]
drain_timeout_secs = 3
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();

        assert_eq!(config.homeassistant.mode, TransportMode::WebSocket);
        assert_eq!(config.homeassistant.poll_interval_secs, 60);
        assert_eq!(config.filters.mode, FilterMode::Denylist);
        assert_eq!(config.filters.include_domains, vec!["sensor", "binary_sensor"]);
        assert_eq!(config.output.mqtt.port, 1883);
        assert_eq!(config.output.mqtt.namespace, "wesense");
        assert_eq!(config.output.mqtt.buffer.batch_size, 1);
        assert_eq!(config.output.clickhouse.buffer.batch_size, 100);
        assert_eq!(config.output.clickhouse.table, "sensor_readings");
        assert_eq!(config.shutdown.drain_timeout_secs, 10);
        assert!(config.bus_enabled());
        assert!(config.store_enabled());
    }

    #[test]
    fn test_full_config_parses() {
        let config =
            Config::from_toml_with(FULL_TOML, env(&[("TEST_HA_TOKEN", "secret")])).unwrap();

        assert_eq!(config.node_name.as_deref(), Some("kitchen-pi"));
        assert_eq!(config.homeassistant.access_token, "secret");
        assert_eq!(config.homeassistant.mode, TransportMode::Polling);
        assert_eq!(config.reconnect.initial_delay_ms, 250);
        assert_eq!(config.filters.mode, FilterMode::Allowlist);
        assert_eq!(config.output.mqtt.buffer.batch_size, 5);
        assert!(!config.store_enabled());

        let office = &config.location.overrides["sensor.office_temp"];
        assert_eq!(office.node_name.as_deref(), Some("office"));
        assert_eq!(office.deployment_type, Some(DeploymentType::Indoor));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_deployment_type_is_rejected() {
        let toml = format!("{MINIMAL_TOML}deployment_type = \"GARAGE\"\n");
        assert!(matches!(
            Config::from_toml_with(&toml, env(&[])),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();
        config
            .apply_env_overrides(env(&[
                ("HA_URL", "http://other:8123"),
                ("LOCAL_MQTT_PORT", "1884"),
                ("DISABLE_CLICKHOUSE", "true"),
                ("NODE_NAME", "garage"),
                ("CLICKHOUSE_TABLE", ""),
            ]))
            .unwrap();

        assert_eq!(config.homeassistant.url, "http://other:8123");
        assert_eq!(config.output.mqtt.port, 1884);
        assert!(!config.output.clickhouse.enabled);
        assert_eq!(config.node_name.as_deref(), Some("garage"));
        // Empty values are ignored
        assert_eq!(config.output.clickhouse.table, "sensor_readings");
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(env(&[("LOCAL_MQTT_PORT", "mqtt")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_dry_run_disables_sinks() {
        let mut config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();
        config.apply_env_overrides(env(&[("DRY_RUN", "1")])).unwrap();

        assert!(!config.bus_enabled());
        assert!(!config.store_enabled());
    }

    #[test]
    fn test_validate_missing_token() {
        let mut config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();
        config.homeassistant.access_token.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("homeassistant.access_token"))
        ));
    }

    #[test]
    fn test_validate_bad_pattern() {
        let mut config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();
        config.filters.exclude_entity_patterns = vec!["sensor.(".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let mut config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();
        config.output.clickhouse.buffer.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_bus_buffer_keeps_bus_defaults() {
        let toml = format!("{MINIMAL_TOML}\n[output.mqtt.buffer]\ncapacity = 500\n\n[output.clickhouse.buffer]\ncapacity = 20\n");
        let config = Config::from_toml_with(&toml, env(&[])).unwrap();

        let bus = &config.output.mqtt.buffer;
        assert_eq!(bus.capacity, 500);
        assert_eq!(bus.batch_size, 1);
        assert_eq!(bus.flush_interval_secs, 1);
        assert_eq!(bus.retry, BufferConfig::bus_default().retry);

        let store = &config.output.clickhouse.buffer;
        assert_eq!(store.capacity, 20);
        assert_eq!(store.batch_size, 100);
        assert_eq!(store.flush_interval_secs, 10);
    }

    #[test]
    fn test_validate_zero_heartbeat_interval() {
        let mut config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();
        config.homeassistant.heartbeat_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();
        config.location.default.latitude = 0.0;
        config.location.default.longitude = 0.0;

        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("(0, 0)")));
        assert!(warnings.iter().any(|w| w.contains("loop-prevention")));
    }

    #[test]
    fn test_validate_out_of_range_override() {
        let mut config = Config::from_toml_with(MINIMAL_TOML, env(&[])).unwrap();
        config.location.overrides.insert(
            "sensor.x".to_string(),
            LocationOverride {
                latitude: 91.0,
                longitude: 0.0,
                altitude: None,
                country_code: None,
                subdivision_code: None,
                deployment_type: None,
                node_name: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_override_inherits_default_fields() {
        let config = Config::from_toml_with(FULL_TOML, env(&[("TEST_HA_TOKEN", "t")])).unwrap();

        let resolved = config.location.resolve("sensor.office_temp");
        assert!(resolved.overridden);
        assert_eq!(resolved.location.country_code, "nz");
        assert_eq!(resolved.location.subdivision_code, "wgn");
        assert_eq!(resolved.node_name, Some("office"));

        let fallback = config.location.resolve("sensor.other");
        assert!(!fallback.overridden);
        assert_eq!(fallback.location.subdivision_code, "auk");
    }

    #[test]
    fn test_websocket_url() {
        let mut ha = HomeAssistantConfig {
            url: "https://ha.example.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(ha.websocket_url(), "wss://ha.example.com/api/websocket");
        assert_eq!(ha.api_base(), "https://ha.example.com/api");

        ha.url = "http://192.168.1.10:8123".to_string();
        assert_eq!(ha.websocket_url(), "ws://192.168.1.10:8123/api/websocket");
    }

    #[test]
    fn test_expand_env_vars() {
        let out = expand_env_vars("a = \"${FOO}\"\nb = \"${MISSING}\"", env(&[("FOO", "bar")]));
        assert_eq!(out, "a = \"bar\"\nb = \"\"");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL_TOML.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.location.default.country_code, "nz");

        let missing = Config::from_file(Path::new("/nonexistent/config.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_example_config_is_valid() {
        let content = include_str!("../../../config/config.example.toml");
        let config = Config::from_toml_with(
            content,
            env(&[("HA_ACCESS_TOKEN", "token"), ("CLICKHOUSE_PASSWORD", "secret")]),
        )
        .unwrap();

        assert_eq!(config.output.clickhouse.password, "secret");
        assert_eq!(config.output.mqtt.buffer.batch_size, 1);
        assert_eq!(config.location.overrides.len(), 1);
        assert!(config.validate().is_ok());
    }
}
