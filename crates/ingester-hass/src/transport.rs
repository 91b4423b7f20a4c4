//! Transport abstraction and its error type.

use async_trait::async_trait;
use ingester_core::RawEntityState;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the upstream link.
///
/// Everything except [`TransportError::AuthRejected`] is recovered by
/// reconnecting.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The hub refused the credentials. Retrying cannot help.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Connection closed")]
    Closed,

    #[error("No message from upstream for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl TransportError {
    /// Whether the process must stop instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::ConnectionFailed(e.to_string())
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// One way of receiving entity states from the hub.
///
/// The connection manager calls `connect` and then `next_batch` repeatedly
/// until an error occurs, after which it calls `close` and starts over.
/// `next_batch` must be cancel safe: it may be dropped at an await point
/// when shutdown is requested.
#[async_trait]
pub trait Transport: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open the link and return the full current state of every entity.
    async fn connect(&mut self) -> Result<Vec<RawEntityState>>;

    /// Wait for the next incremental changes.
    async fn next_batch(&mut self) -> Result<Vec<RawEntityState>>;

    /// Release the link. Called before every reconnect and on shutdown.
    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_auth_rejection_is_fatal() {
        assert!(TransportError::AuthRejected("invalid token".into()).is_fatal());

        assert!(!TransportError::ConnectionFailed("refused".into()).is_fatal());
        assert!(!TransportError::Closed.is_fatal());
        assert!(!TransportError::HeartbeatTimeout(Duration::from_secs(90)).is_fatal());
        assert!(!TransportError::Malformed("bad json".into()).is_fatal());
        assert!(!TransportError::Http("status 502".into()).is_fatal());
    }

    #[test]
    fn test_json_errors_are_malformed() {
        let err: TransportError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, TransportError::Malformed(_)));
    }
}
