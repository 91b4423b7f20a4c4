//! Process wiring: sinks, pipeline owner, upstream link and shutdown.

use crate::ingester::{IngestStatsSnapshot, Ingester};
use anyhow::{anyhow, Context, Result};
use ingester_core::config::{Config, HomeAssistantConfig, TransportMode};
use ingester_core::{Backoff, StateHandler};
use ingester_hass::{
    ConnectionManager, HassClient, PollTransport, TransportError, WebSocketSettings,
    WebSocketTransport,
};
use ingester_sinks::{BusPublisher, DrainReport, SinkBuffer, SinkRegistration, StoreWriter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What a finished run looked like.
#[derive(Debug)]
pub struct RunSummary {
    pub stats: IngestStatsSnapshot,
    pub drain: DrainReport,
}

/// Build the enabled sinks and start their queues.
pub async fn start_sinks(config: &Config) -> SinkBuffer {
    let mut registrations = Vec::new();

    if config.bus_enabled() {
        let publisher = BusPublisher::connect(&config.output.mqtt);
        registrations.push(SinkRegistration::new(
            Arc::new(publisher),
            config.output.mqtt.buffer.clone(),
        ));
    } else {
        info!("MQTT output disabled");
    }

    let store = StoreWriter::new(&config.output.clickhouse);
    if config.store_enabled() {
        store.check_connection().await;
    }
    registrations.push(
        SinkRegistration::new(Arc::new(store), config.output.clickhouse.buffer.clone())
            .enabled(config.store_enabled()),
    );

    SinkBuffer::start(
        registrations,
        Duration::from_secs(config.shutdown.drain_timeout_secs),
    )
}

/// Drive the configured transport until cancelled or rejected.
pub async fn run_upstream<H>(
    config: &HomeAssistantConfig,
    backoff: Backoff,
    handler: &H,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    H: StateHandler + ?Sized,
{
    match config.mode {
        TransportMode::WebSocket => {
            let transport = WebSocketTransport::new(WebSocketSettings::from(config));
            ConnectionManager::new(transport, backoff)
                .run(handler, cancel)
                .await
        }
        TransportMode::Polling => {
            let client = HassClient::new(config)?;
            let interval = Duration::from_secs(config.poll_interval_secs);
            let transport = PollTransport::new(client, interval);
            ConnectionManager::new(transport, backoff)
                .run(handler, cancel)
                .await
        }
    }
}

/// Run the gateway until `shutdown` resolves or the hub rejects the token.
///
/// The sink queues are drained in both cases. A rejected token is returned
/// as an error after the drain.
pub async fn run<S>(config: Config, shutdown: S) -> Result<RunSummary>
where
    S: Future<Output = ()> + Send,
{
    info!(
        url = %config.homeassistant.url,
        mode = ?config.homeassistant.mode,
        dry_run = config.dry_run,
        "Starting Home Assistant ingester"
    );

    let sinks = start_sinks(&config).await;
    let ingester = Arc::new(Ingester::new(&config, sinks)?);

    let cancel = CancellationToken::new();
    let mut upstream = {
        let ingester = ingester.clone();
        let cancel = cancel.clone();
        let ha = config.homeassistant.clone();
        let backoff = config.reconnect.clone();
        tokio::spawn(async move { run_upstream(&ha, backoff, ingester.as_ref(), cancel).await })
    };

    let drain_timeout = Duration::from_secs(config.shutdown.drain_timeout_secs);
    let outcome = tokio::select! {
        joined = &mut upstream => Some(joined),
        _ = shutdown => {
            info!("Shutdown requested");
            cancel.cancel();
            // Unblocks a batch that is waiting on a full sink queue
            ingester.sinks().begin_drain();
            match tokio::time::timeout(drain_timeout, &mut upstream).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    warn!(
                        timeout_secs = drain_timeout.as_secs(),
                        "Upstream did not stop in time, aborting it"
                    );
                    upstream.abort();
                    let _ = upstream.await;
                    None
                }
            }
        }
    };

    let fatal = match outcome {
        Some(Ok(Ok(()))) | None => None,
        Some(Ok(Err(e))) => {
            error!(error = %e, "Upstream link failed");
            Some(anyhow::Error::new(e))
        }
        Some(Err(e)) => Some(anyhow!("upstream task failed: {e}")),
    };

    let ingester = Arc::into_inner(ingester)
        .context("pipeline still referenced after the upstream task ended")?;
    let (stats, drain) = ingester.shutdown().await;
    if drain.timed_out {
        warn!(
            dropped = drain.dropped_readings(),
            "Sink drain hit the deadline"
        );
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(RunSummary { stats, drain }),
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
