//! CLI tests for the hass-ingester binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

/// Variables that would override the config files used here.
const OVERRIDES: &[&str] = &[
    "CONFIG_PATH",
    "HA_URL",
    "HA_ACCESS_TOKEN",
    "DRY_RUN",
    "NODE_NAME",
    "DISABLE_CLICKHOUSE",
    "RUST_LOG",
];

fn ingester() -> Command {
    let mut cmd = Command::cargo_bin("hass-ingester").unwrap();
    for name in OVERRIDES {
        cmd.env_remove(name);
    }
    cmd
}

fn config_file(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const VALID: &str = r#"
[homeassistant]
url = "http://homeassistant.local:8123"
access_token = "${TEST_HA_TOKEN}"

[location.default]
latitude = -36.8485
longitude = 174.7633
country_code = "NZ"
subdivision_code = "AUK"

[location.overrides."sensor.shed_temp"]
latitude = -36.9
longitude = 174.8

[filters]
exclude_entity_patterns = ["^sensor\\.test_"]
"#;

#[test]
fn test_cli_help() {
    ingester()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Home Assistant to WeSense ingestion gateway"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn test_cli_version() {
    ingester()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hass-ingester"));
}

#[test]
fn test_no_subcommand_shows_error() {
    ingester().assert().failure();
}

#[test]
fn test_run_help_lists_flags() {
    ingester()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--log-level"))
        .stdout(predicate::str::contains("--log-json"));
}

#[test]
fn test_check_config_accepts_valid_file() {
    let file = config_file(VALID);

    ingester()
        .env("TEST_HA_TOKEN", "long-lived-token")
        .args(["check-config", "--config"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("1 location override(s)"));
}

#[test]
fn test_check_config_reports_missing_token() {
    let file = config_file(VALID);

    ingester()
        .env_remove("TEST_HA_TOKEN")
        .args(["check-config", "--config"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("homeassistant.access_token"));
}

#[test]
fn test_check_config_rejects_bad_pattern() {
    let file = config_file(&VALID.replace(r#"^sensor\\.test_"#, "sensor.("));

    ingester()
        .env("TEST_HA_TOKEN", "long-lived-token")
        .args(["check-config", "--config"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid entity pattern"));
}

#[test]
fn test_check_config_prints_warnings() {
    let file = config_file(&VALID.replace(r#"["^sensor\\.test_"]"#, "[]"));

    ingester()
        .env("TEST_HA_TOKEN", "long-lived-token")
        .args(["check-config", "--config"])
        .arg(file.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("warning: No exclude_entity_patterns"));
}

#[test]
fn test_check_config_missing_file() {
    ingester()
        .args(["check-config", "--config", "/nonexistent/config.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_run_exits_non_zero_on_invalid_config() {
    let file = config_file("[homeassistant]\nurl = \"ftp://nowhere\"\naccess_token = \"x\"\n");

    ingester()
        .args(["run", "--config"])
        .arg(file.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("Invalid configuration"));
}
