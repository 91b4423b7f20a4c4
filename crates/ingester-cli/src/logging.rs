//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Environment variable selecting JSON log output.
pub const LOG_JSON_ENV: &str = "LOG_JSON";

/// Environment variable with the default log level.
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Filter directives for a plain level such as `info` or `debug`.
///
/// Our own crates log at `level`; dependencies stay at `warn` unless the
/// level is more severe than that.
pub fn default_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    let deps = match level.as_str() {
        "error" | "off" => level.as_str(),
        _ => "warn",
    };
    format!(
        "{deps},hass_ingester={level},ingester_core={level},ingester_hass={level},ingester_sinks={level}"
    )
}

/// Whether a flag-like environment value is set.
pub fn env_flag(value: Option<String>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging already initialised: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_keep_dependencies_quiet() {
        let directives = default_directives("DEBUG");
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("ingester_hass=debug"));
        assert!(directives.contains("hass_ingester=debug"));
    }

    #[test]
    fn test_error_level_applies_everywhere() {
        assert!(default_directives("error").starts_with("error,"));
    }

    #[test]
    fn test_directives_parse() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(EnvFilter::try_new(default_directives(level)).is_ok(), "{level}");
        }
    }

    #[test]
    fn test_env_flag() {
        assert!(env_flag(Some("true".into())));
        assert!(env_flag(Some(" 1 ".into())));
        assert!(!env_flag(Some("no".into())));
        assert!(!env_flag(None));
    }
}
