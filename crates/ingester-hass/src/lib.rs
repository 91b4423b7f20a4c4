//! Upstream link to Home Assistant.
//!
//! Two transports deliver [`RawEntityState`](ingester_core::RawEntityState)s:
//!
//! - [`WebSocketTransport`]: `state_changed` subscription, real time
//! - [`PollTransport`]: periodic `GET /api/states` with snapshot diffing
//!
//! [`ConnectionManager`] drives either one through the reconnect state
//! machine and hands every state to a
//! [`StateHandler`](ingester_core::StateHandler).

pub mod client;
pub mod entities;
pub mod manager;
pub mod poll;
pub mod transport;
pub mod websocket;

pub use client::HassClient;
pub use entities::HassEntityState;
pub use manager::{ConnectionManager, ConnectionState};
pub use poll::{PollTransport, StateFetcher};
pub use transport::{Transport, TransportError};
pub use websocket::{WebSocketSettings, WebSocketTransport};
