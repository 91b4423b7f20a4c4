//! Command-line entry point for the Home Assistant ingester.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use hass_ingester::logging;
use ingester_core::Config;
use tracing::{error, info, warn};

/// Home Assistant to WeSense ingestion gateway.
#[derive(Parser, Debug)]
#[command(name = "hass-ingester")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway until SIGINT or SIGTERM.
    Run {
        /// Config file (defaults to $CONFIG_PATH, then config/config.toml).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log readings instead of writing them to any sink.
        #[arg(long)]
        dry_run: bool,

        /// Log level for the ingester crates. RUST_LOG overrides it.
        #[arg(long, env = "LOG_LEVEL", default_value = "info")]
        log_level: String,

        /// Emit JSON logs.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate the configuration and exit.
    CheckConfig {
        /// Config file (defaults to $CONFIG_PATH, then config/config.toml).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config,
            dry_run,
            log_level,
            log_json,
        } => {
            let json = log_json || logging::env_flag(std::env::var(logging::LOG_JSON_ENV).ok());
            logging::init(&log_level, json);
            run(config.as_deref(), dry_run).await
        }
        Command::CheckConfig { config } => check_config(config.as_deref()),
    }
}

async fn run(path: Option<&Path>, dry_run: bool) -> ExitCode {
    let mut config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if dry_run {
        config.dry_run = true;
    }

    match config.validate() {
        Ok(warnings) => {
            for warning in warnings {
                warn!("{warning}");
            }
        }
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    }

    match hass_ingester::run(config, hass_ingester::shutdown_signal()).await {
        Ok(summary) => {
            info!(
                processed = summary.stats.processed,
                dropped = summary.drain.dropped_readings(),
                "Shutdown complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Ingester stopped");
            ExitCode::FAILURE
        }
    }
}

fn check_config(path: Option<&Path>) -> ExitCode {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match config.validate() {
        Ok(warnings) => {
            for warning in &warnings {
                eprintln!("warning: {warning}");
            }
            println!(
                "Configuration OK ({:?} mode, {} location override(s))",
                config.homeassistant.mode,
                config.location.overrides.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
