//! Connection state machine.
//!
//! ```text
//!                 ┌──────────── backoff expired ────────────┐
//!                 v                                         │
//! Disconnected ─> Connecting ── ok ──> Connected ── error ──> Reconnecting
//!                    │                                      ^
//!                    ├── recoverable error ─────────────────┘
//!                    └── credentials rejected ──> Fatal
//!
//! any state ── cancel ──> ShuttingDown
//! ```
//!
//! The manager is the only writer of [`ConnectionState`]. Observers get a
//! `watch` receiver from [`ConnectionManager::subscribe`].

use crate::transport::{Transport, TransportError};
use ingester_core::{Backoff, StateHandler};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A link that stays up this long counts as healthy even without updates.
const STABLE_LINK: Duration = Duration::from_secs(30);

/// Upstream link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
    /// Terminal: the hub rejected our credentials
    Fatal,
}

/// Owns the upstream link and feeds the pipeline.
pub struct ConnectionManager<T> {
    transport: T,
    backoff: Backoff,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, backoff: Backoff) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            backoff,
            state_tx,
        }
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!(
                transport = self.transport.name(),
                from = ?previous,
                to = ?next,
                "Connection state changed"
            );
        }
    }

    /// Run until cancelled or until the credentials are rejected.
    ///
    /// A batch that has already been received is handed to `handler` in full
    /// before cancellation is honoured.
    pub async fn run<H>(mut self, handler: &H, cancel: CancellationToken) -> Result<(), TransportError>
    where
        H: StateHandler + ?Sized,
    {
        let mut failures: u32 = 0;

        'session: loop {
            self.transition(ConnectionState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(snapshot) => {
                    self.transition(ConnectionState::Connected);
                    let connected_at = Instant::now();
                    // Backoff resets once the link has delivered an update
                    let mut healthy = false;
                    info!(entities = snapshot.len(), "Full resync");
                    handler.handle_resync(snapshot).await;

                    loop {
                        let batch = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'session,
                            result = self.transport.next_batch() => result,
                        };

                        match batch {
                            Ok(states) => {
                                healthy = true;
                                for state in states {
                                    handler.handle_state(state).await;
                                }
                            }
                            Err(e) if e.is_fatal() => return self.fail(e).await,
                            Err(e) => {
                                warn!(error = %e, "Upstream link lost");
                                break;
                            }
                        }
                    }

                    if healthy || connected_at.elapsed() >= STABLE_LINK {
                        failures = 0;
                    }
                }
                Err(e) if e.is_fatal() => return self.fail(e).await,
                Err(e) => warn!(error = %e, "Connection attempt failed"),
            }

            self.transport.close().await;
            self.transition(ConnectionState::Reconnecting);

            failures = failures.saturating_add(1);
            let delay = self.backoff.delay_for_attempt(failures);
            info!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(ConnectionState::ShuttingDown);
        self.transport.close().await;
        Ok(())
    }

    async fn fail(&mut self, e: TransportError) -> Result<(), TransportError> {
        error!(error = %e, "Unrecoverable upstream error, giving up");
        self.transport.close().await;
        self.transition(ConnectionState::Fatal);
        Err(e)
    }
}
