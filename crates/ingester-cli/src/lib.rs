//! Home Assistant ingestion gateway.
//!
//! Wires the pipeline together:
//!
//! ```text
//! ConnectionManager ──> Ingester ──> SinkBuffer ──┬─> BusPublisher (MQTT)
//!  (ingester-hass)      filter                    └─> StoreWriter (ClickHouse)
//!                       transform
//!                       validate
//! ```

pub mod app;
pub mod ingester;
pub mod logging;

pub use app::{run, shutdown_signal, RunSummary};
pub use ingester::{IngestStats, IngestStatsSnapshot, Ingester};
