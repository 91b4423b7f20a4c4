//! Entity filtering and loop prevention.
//!
//! The engine is built once from [`FiltersConfig`] and is immutable
//! afterwards. [`FilterEngine::should_accept`] is pure and takes `&self`, so
//! one engine can be shared across tasks behind an `Arc`.
//!
//! Evaluation order:
//!
//! ```text
//! exclude rules (loop prevention first) ── match ──> reject
//!        │
//! allowlist mode: include rules ── no match ──> reject
//!        │
//! include_domains ── not listed ──> reject
//!        │
//! include_device_classes ── not listed ──> reject
//!        │
//!      accept
//! ```

use crate::config::{ConfigError, FilterMode, FiltersConfig};
use crate::model::RawEntityState;
use regex::Regex;
use std::collections::HashSet;

/// Matches ids that embed a lowercase 12-hex MAC token between separators,
/// i.e. devices this gateway or a sibling has published upstream.
pub const LOOP_PREVENTION_PATTERN: &str = r"(?:^|[._-])[0-9a-f]{12}(?:[._-]|$)";

/// Case-insensitive variant used only by the startup audit.
const SUSPICIOUS_MAC_PATTERN: &str = r"(?i)(?:^|[._-])[0-9a-f]{12}(?:[._-]|$)";

/// Keywords that hint at gateway-published devices.
const SUSPICIOUS_KEYWORDS: [&str; 5] = ["wesense", "meshtastic", "esp32", "esp8266", "esphome"];

/// Rule polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Include,
    Exclude,
}

/// A compiled pattern with a polarity and optional device-class constraint.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pattern: Regex,
    polarity: Polarity,
    device_class: Option<String>,
}

impl FilterRule {
    /// Compile a regex rule.
    pub fn new(pattern: &str, polarity: Polarity) -> Result<Self, ConfigError> {
        let compiled = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: compiled,
            polarity,
            device_class: None,
        })
    }

    /// Rule matching exactly one entity id.
    pub fn exact(entity_id: &str, polarity: Polarity) -> Result<Self, ConfigError> {
        Self::new(&format!("^{}$", regex::escape(entity_id)), polarity)
    }

    /// Rule from a glob where `*` matches any run of characters.
    pub fn wildcard(glob: &str, polarity: Polarity) -> Result<Self, ConfigError> {
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Self::new(&format!("^{body}$"), polarity)
    }

    /// Restrict the rule to one device class.
    pub fn for_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Whether the rule applies to a state.
    pub fn matches(&self, state: &RawEntityState) -> bool {
        if let Some(required) = &self.device_class {
            if state.device_class.as_deref() != Some(required.as_str()) {
                return false;
            }
        }
        self.pattern.is_match(&state.entity_id)
    }
}

/// Decides which upstream entities enter the pipeline.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    mode: FilterMode,
    rules: Vec<FilterRule>,
    include_domains: HashSet<String>,
    include_device_classes: HashSet<String>,
    audit: Regex,
}

impl FilterEngine {
    /// Build the engine. The loop-prevention rule is always the first rule.
    pub fn from_config(config: &FiltersConfig) -> Result<Self, ConfigError> {
        let mut rules = vec![FilterRule::new(LOOP_PREVENTION_PATTERN, Polarity::Exclude)?];

        for pattern in &config.exclude_entity_patterns {
            rules.push(FilterRule::new(pattern, Polarity::Exclude)?);
        }
        for entity_id in &config.exclude_entities {
            rules.push(FilterRule::exact(entity_id, Polarity::Exclude)?);
        }
        for glob in &config.include_entities {
            rules.push(FilterRule::wildcard(glob, Polarity::Include)?);
        }

        Self::with_rules(
            config.mode,
            rules,
            config.include_domains.iter().cloned(),
            config.include_device_classes.iter().cloned(),
        )
    }

    /// Build the engine from explicit rules.
    pub fn with_rules(
        mode: FilterMode,
        rules: Vec<FilterRule>,
        include_domains: impl IntoIterator<Item = String>,
        include_device_classes: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let audit = Regex::new(SUSPICIOUS_MAC_PATTERN).map_err(|source| {
            ConfigError::InvalidPattern {
                pattern: SUSPICIOUS_MAC_PATTERN.to_string(),
                source,
            }
        })?;

        Ok(Self {
            mode,
            rules,
            include_domains: include_domains.into_iter().collect(),
            include_device_classes: include_device_classes.into_iter().collect(),
            audit,
        })
    }

    /// Ordered rules, loop prevention first.
    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Whether the entity should be transformed and dispatched.
    pub fn should_accept(&self, state: &RawEntityState) -> bool {
        if self
            .rules
            .iter()
            .any(|rule| rule.polarity == Polarity::Exclude && rule.matches(state))
        {
            return false;
        }

        if self.mode == FilterMode::Allowlist
            && !self
                .rules
                .iter()
                .any(|rule| rule.polarity == Polarity::Include && rule.matches(state))
        {
            return false;
        }

        if !self.include_domains.is_empty() && !self.include_domains.contains(state.domain()) {
            return false;
        }

        if !self.include_device_classes.is_empty() {
            return state
                .device_class
                .as_ref()
                .is_some_and(|class| self.include_device_classes.contains(class));
        }

        true
    }

    /// Accepted entities that still look gateway-published.
    ///
    /// Catches uppercase MAC tokens and firmware keywords the case-sensitive
    /// loop-prevention rule lets through.
    pub fn suspicious_entities<'a>(&self, states: &'a [RawEntityState]) -> Vec<&'a str> {
        states
            .iter()
            .filter(|state| self.should_accept(state))
            .filter(|state| {
                let lower = state.entity_id.to_ascii_lowercase();
                self.audit.is_match(&state.entity_id)
                    || SUSPICIOUS_KEYWORDS.iter().any(|kw| lower.contains(kw))
            })
            .map(|state| state.entity_id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state(entity_id: &str) -> RawEntityState {
        RawEntityState::new(entity_id, "1", Utc::now())
    }

    fn default_engine() -> FilterEngine {
        FilterEngine::from_config(&FiltersConfig::default()).unwrap()
    }

    #[test]
    fn test_loop_prevention_rejects_mac_tokens() {
        let engine = default_engine();

        for id in [
            "sensor.office_301274c0e8fc_temperature",
            "sensor.301274c0e8fc_humidity",
            "sensor.wesense_aabbccddeeff",
            "sensor.node-0123456789ab-pm25",
        ] {
            assert!(!engine.should_accept(&state(id)), "{id} should be rejected");
            assert!(
                !engine.should_accept(&state(id).with_device_class("temperature")),
                "{id} should be rejected regardless of device class"
            );
        }
    }

    #[test]
    fn test_loop_prevention_is_case_sensitive_and_bounded() {
        let engine = default_engine();

        // Uppercase hex is not the published form
        assert!(engine.should_accept(&state("sensor.office_301274C0E8FC_temperature")));
        // 13 hex characters is not a MAC token
        assert!(engine.should_accept(&state("sensor.office_301274c0e8fc1_temperature")));
        // Unbounded run inside a word
        assert!(engine.should_accept(&state("sensor.x301274c0e8fcx")));
    }

    #[test]
    fn test_default_accepts_plain_sensor() {
        let engine = default_engine();
        assert!(engine.should_accept(&state("sensor.ecowitt_outdoor_temp")));
        assert!(engine.should_accept(&state("binary_sensor.front_door")));
    }

    #[test]
    fn test_domain_gate() {
        let engine = default_engine();
        assert!(!engine.should_accept(&state("light.kitchen")));
        assert!(!engine.should_accept(&state("switch.heater")));
    }

    #[test]
    fn test_device_class_gate() {
        let config = FiltersConfig {
            include_device_classes: vec!["temperature".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::from_config(&config).unwrap();

        assert!(engine.should_accept(&state("sensor.t").with_device_class("temperature")));
        assert!(!engine.should_accept(&state("sensor.h").with_device_class("humidity")));
        assert!(!engine.should_accept(&state("sensor.none")));
    }

    #[test]
    fn test_user_patterns_and_exact_excludes() {
        let config = FiltersConfig {
            exclude_entity_patterns: vec![r"^sensor\.test_".to_string()],
            exclude_entities: vec!["sensor.noisy".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::from_config(&config).unwrap();

        assert!(!engine.should_accept(&state("sensor.test_probe")));
        assert!(!engine.should_accept(&state("sensor.noisy")));
        assert!(engine.should_accept(&state("sensor.noisy_neighbour")));
    }

    #[test]
    fn test_allowlist_wildcards() {
        let config = FiltersConfig {
            mode: FilterMode::Allowlist,
            include_entities: vec!["sensor.ecowitt_*".to_string(), "sensor.attic".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::from_config(&config).unwrap();

        assert!(engine.should_accept(&state("sensor.ecowitt_outdoor_temp")));
        assert!(engine.should_accept(&state("sensor.attic")));
        assert!(!engine.should_accept(&state("sensor.attic_2")));
        assert!(!engine.should_accept(&state("sensor.kitchen")));
    }

    #[test]
    fn test_allowlist_cannot_bypass_loop_prevention() {
        let config = FiltersConfig {
            mode: FilterMode::Allowlist,
            include_entities: vec!["sensor.*".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::from_config(&config).unwrap();

        assert!(!engine.should_accept(&state("sensor.office_301274c0e8fc_temperature")));
    }

    #[test]
    fn test_device_class_constrained_rule() {
        let rule = FilterRule::new(r"^sensor\.garage_", Polarity::Exclude)
            .unwrap()
            .for_device_class("battery");
        let engine = FilterEngine::with_rules(
            FilterMode::Denylist,
            vec![rule],
            Vec::new(),
            Vec::new(),
        )
        .unwrap();

        assert!(!engine.should_accept(&state("sensor.garage_door").with_device_class("battery")));
        assert!(engine.should_accept(&state("sensor.garage_door").with_device_class("temperature")));
    }

    #[test]
    fn test_invalid_pattern() {
        let config = FiltersConfig {
            exclude_entity_patterns: vec!["[unclosed".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            FilterEngine::from_config(&config),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_suspicious_entities() {
        let engine = default_engine();
        let states = vec![
            state("sensor.office_301274C0E8FC_temperature"),
            state("sensor.esphome_kitchen_temp"),
            state("sensor.office_301274c0e8fc_temperature"),
            state("sensor.ecowitt_outdoor_temp"),
        ];

        let suspicious = engine.suspicious_entities(&states);
        assert_eq!(
            suspicious,
            vec![
                "sensor.office_301274C0E8FC_temperature",
                "sensor.esphome_kitchen_temp"
            ]
        );
    }

    #[test]
    fn test_engine_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FilterEngine>();
    }
}
