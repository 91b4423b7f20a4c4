//! Home Assistant WebSocket transport for real-time state updates.
//!
//! Handshake on every connect:
//!
//! ```text
//! server: {"type": "auth_required"}
//! client: {"type": "auth", "access_token": "..."}
//! server: {"type": "auth_ok"} | {"type": "auth_invalid", "message": "..."}
//! client: {"id": 1, "type": "subscribe_events", "event_type": "state_changed"}
//! client: {"id": 2, "type": "get_states"}
//! server: result 1, events..., result 2 (full snapshot)
//! ```
//!
//! Events received before the snapshot are held back and delivered after it.

use crate::entities::HassEntityState;
use crate::transport::{Result, Transport, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use ingester_core::config::HomeAssistantConfig;
use ingester_core::RawEntityState;
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    pub url: String,
    pub access_token: String,
    /// Bound for connect plus handshake
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl From<&HomeAssistantConfig> for WebSocketSettings {
    fn from(config: &HomeAssistantConfig) -> Self {
        Self {
            url: config.websocket_url(),
            access_token: config.access_token.clone(),
            handshake_timeout: Duration::from_secs(config.request_timeout_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
        }
    }
}

/// `state_changed` subscription over the Home Assistant WebSocket API.
pub struct WebSocketTransport {
    settings: WebSocketSettings,
    stream: Option<WsStream>,
    next_id: u64,
    pending: VecDeque<RawEntityState>,
    last_frame: Instant,
    last_ping: Instant,
}

const SUBSCRIBE_ID: u64 = 1;
const GET_STATES_ID: u64 = 2;

impl WebSocketTransport {
    pub fn new(settings: WebSocketSettings) -> Self {
        let now = Instant::now();
        Self {
            settings,
            stream: None,
            next_id: GET_STATES_ID + 1,
            pending: VecDeque::new(),
            last_frame: now,
            last_ping: now,
        }
    }

    fn stream(&mut self) -> Result<&mut WsStream> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    async fn send_json(&mut self, message: JsonValue) -> Result<()> {
        self.stream()?
            .send(Message::Text(message.to_string()))
            .await?;
        Ok(())
    }

    /// Next JSON frame, skipping control frames.
    async fn recv_json(&mut self) -> Result<JsonValue> {
        loop {
            let frame = self.stream()?.next().await.ok_or(TransportError::Closed)??;
            self.last_frame = Instant::now();

            match frame {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(_) => return Err(TransportError::Closed),
                _ => continue,
            }
        }
    }

    async fn handshake(&mut self) -> Result<Vec<RawEntityState>> {
        let (stream, _) = connect_async(self.settings.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.stream = Some(stream);
        self.pending.clear();
        self.next_id = GET_STATES_ID + 1;

        let hello = self.recv_json().await?;
        if hello["type"] != "auth_required" {
            return Err(TransportError::Malformed(format!(
                "expected auth_required, got {}",
                hello["type"]
            )));
        }

        let token = self.settings.access_token.clone();
        self.send_json(json!({ "type": "auth", "access_token": token }))
            .await?;

        let auth = self.recv_json().await?;
        match auth["type"].as_str() {
            Some("auth_ok") => {}
            Some("auth_invalid") => {
                let reason = auth["message"].as_str().unwrap_or("invalid access token");
                return Err(TransportError::AuthRejected(reason.to_string()));
            }
            _ => {
                return Err(TransportError::Malformed(format!(
                    "unexpected auth response {auth}"
                )))
            }
        }

        self.send_json(json!({
            "id": SUBSCRIBE_ID,
            "type": "subscribe_events",
            "event_type": "state_changed"
        }))
        .await?;
        self.send_json(json!({ "id": GET_STATES_ID, "type": "get_states" }))
            .await?;

        loop {
            let message = self.recv_json().await?;
            match message["type"].as_str() {
                Some("event") => {
                    if let Some(state) = parse_state_changed(&message)? {
                        self.pending.push_back(state);
                    }
                }
                Some("result") => {
                    let id = message["id"].as_u64();
                    if message["success"] != true {
                        return Err(TransportError::Malformed(format!(
                            "command {} failed: {}",
                            id.unwrap_or_default(),
                            message["error"]
                        )));
                    }
                    if id == Some(GET_STATES_ID) {
                        let states: Vec<HassEntityState> =
                            serde_json::from_value(message["result"].clone())?;
                        let received_at = Utc::now();
                        return Ok(states
                            .into_iter()
                            .map(|state| state.into_raw(received_at))
                            .collect());
                    }
                }
                _ => {}
            }
        }
    }

    async fn send_ping(&mut self) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;
        self.last_ping = Instant::now();
        self.send_json(json!({ "id": id, "type": "ping" })).await
    }
}

/// Extract the new state from a `state_changed` event message.
///
/// Returns `None` for other event types and for removed entities.
pub fn parse_state_changed(message: &JsonValue) -> Result<Option<RawEntityState>> {
    let event = message
        .get("event")
        .ok_or_else(|| TransportError::Malformed("event message without event".to_string()))?;

    if event["event_type"] != "state_changed" {
        return Ok(None);
    }

    match event["data"].get("new_state") {
        None | Some(JsonValue::Null) => Ok(None),
        Some(new_state) => {
            let state: HassEntityState = serde_json::from_value(new_state.clone())?;
            Ok(Some(state.into_raw(Utc::now())))
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&mut self) -> Result<Vec<RawEntityState>> {
        let timeout = self.settings.handshake_timeout;
        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(result) => {
                let now = Instant::now();
                self.last_frame = now;
                self.last_ping = now;
                result
            }
            Err(_) => Err(TransportError::ConnectionFailed(format!(
                "handshake timed out after {timeout:?}"
            ))),
        }
    }

    async fn next_batch(&mut self) -> Result<Vec<RawEntityState>> {
        if !self.pending.is_empty() {
            return Ok(self.pending.drain(..).collect());
        }

        loop {
            let silence_deadline = self.last_frame + self.settings.heartbeat_timeout;
            let ping_due = self.last_ping + self.settings.heartbeat_interval;
            let stream = self.stream()?;

            tokio::select! {
                frame = stream.next() => {
                    let frame = frame.ok_or(TransportError::Closed)??;
                    self.last_frame = Instant::now();

                    let text = match frame {
                        Message::Text(text) => text,
                        Message::Close(_) => return Err(TransportError::Closed),
                        _ => continue,
                    };

                    let message: JsonValue = serde_json::from_str(&text)?;
                    match message["type"].as_str() {
                        Some("event") => {
                            if let Some(state) = parse_state_changed(&message)? {
                                return Ok(vec![state]);
                            }
                        }
                        Some("auth_invalid") => {
                            return Err(TransportError::AuthRejected(
                                "token revoked during session".to_string(),
                            ));
                        }
                        Some(_) => {}
                        None => {
                            return Err(TransportError::Malformed(format!(
                                "message without type: {text}"
                            )));
                        }
                    }
                }
                _ = tokio::time::sleep_until(silence_deadline.min(ping_due)) => {
                    if Instant::now() >= silence_deadline {
                        return Err(TransportError::HeartbeatTimeout(self.settings.heartbeat_timeout));
                    }
                    self.send_ping().await?;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                tracing::debug!(error = %e, "WebSocket close failed");
            }
        }
        self.pending.clear();
    }
}
