//! Output side of the ingester.
//!
//! [`SinkBuffer`] fans every canonical reading out to one bounded queue per
//! enabled [`Sink`]. Two sinks ship with the crate:
//!
//! - [`BusPublisher`]: one MQTT message per reading
//! - [`StoreWriter`]: one multi-row ClickHouse insert per batch

pub mod buffer;
pub mod bus;
pub mod sink;
pub mod store;

pub use buffer::{DrainReport, SinkBuffer, SinkEnvelope, SinkRegistration, SinkStats, SinkStatsSnapshot};
pub use bus::{topic_for, BusPublisher};
pub use sink::{Sink, SinkError};
pub use store::{ReadingRow, StoreWriter};
