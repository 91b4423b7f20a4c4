//! Output sink abstraction.

use async_trait::async_trait;
use ingester_core::CanonicalReading;
use thiserror::Error;

/// Errors raised by a sink flush.
///
/// None of them are fatal. The sink buffer retries the batch and drops it
/// once the retry budget is spent.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Store write failed: {0}")]
    Store(#[from] clickhouse::error::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rumqttc::ClientError> for SinkError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Publish(e.to_string())
    }
}

/// Result type for sink operations.
pub type Result<T> = std::result::Result<T, SinkError>;

/// A destination for canonical readings.
///
/// `flush` receives batches in queue order and is never called
/// concurrently for the same sink.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name for logs and stats.
    fn name(&self) -> &'static str;

    /// Write one batch. The whole batch is retried on error.
    async fn flush(&self, batch: &[CanonicalReading]) -> Result<()>;

    /// Release resources after the final flush.
    async fn close(&self) {}
}
