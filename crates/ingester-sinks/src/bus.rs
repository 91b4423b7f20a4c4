//! Bus publisher: one MQTT message per reading.

use crate::sink::{Result, Sink, SinkError};
use async_trait::async_trait;
use ingester_core::config::MqttOutputConfig;
use ingester_core::{CanonicalReading, DATA_SOURCE};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between event loop errors while the broker is unreachable.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Request channel capacity between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 100;

/// Topic for a reading: `<namespace>/decoded/homeassistant/<country>/<subdivision>/<device_id>`.
pub fn topic_for(namespace: &str, reading: &CanonicalReading) -> String {
    format!(
        "{}/decoded/{}/{}/{}/{}",
        namespace.trim_end_matches('/'),
        DATA_SOURCE.to_ascii_lowercase(),
        reading.country_code,
        reading.subdivision_code,
        reading.device_id
    )
}

/// Publishes readings as JSON with QoS 1, not retained.
///
/// The connection is kept up by a background task polling the rumqttc
/// event loop, which reconnects on its own after a failure.
pub struct BusPublisher {
    client: AsyncClient,
    namespace: String,
    connected: Arc<AtomicBool>,
}

impl BusPublisher {
    /// Create the client and spawn its event loop.
    pub fn connect(config: &MqttOutputConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let broker = format!("{}:{}", config.broker, config.port);
        info!(broker = %broker, namespace = %config.namespace, "Connecting to MQTT broker");

        tokio::spawn(poll_event_loop(event_loop, connected.clone(), broker));

        Self {
            client,
            namespace: config.namespace.clone(),
            connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

async fn poll_event_loop(mut event_loop: EventLoop, connected: Arc<AtomicBool>, broker: String) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Relaxed);
                info!(broker = %broker, "Connected to MQTT broker");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.store(false, Ordering::Relaxed);
                debug!(broker = %broker, "MQTT client disconnected");
                break;
            }
            Ok(_) => {}
            Err(rumqttc::ConnectionError::RequestsDone) => break,
            Err(e) => {
                if connected.swap(false, Ordering::Relaxed) {
                    warn!(broker = %broker, error = %e, "MQTT connection lost");
                } else {
                    debug!(broker = %broker, error = %e, "MQTT broker unreachable");
                }
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
}

#[async_trait]
impl Sink for BusPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn flush(&self, batch: &[CanonicalReading]) -> Result<()> {
        if !self.is_connected() {
            return Err(SinkError::Unavailable("not connected to MQTT broker".to_string()));
        }

        for reading in batch {
            let topic = topic_for(&self.namespace, reading);
            let payload = serde_json::to_vec(reading)?;
            self.client
                .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
                .await?;
            debug!(topic = %topic, "Published reading");
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect failed");
        }
    }
}
