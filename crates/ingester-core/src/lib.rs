//! Core types and pure pipeline stages for the Home Assistant ingester.
//!
//! ```text
//! RawEntityState ──> FilterEngine ──> ReadingTransformer ──> CanonicalReading
//!                       (accept?)       (+ LocationConfig)
//! ```
//!
//! Nothing in this crate performs I/O apart from loading the configuration
//! file. The upstream link lives in `ingester-hass` and the sinks in
//! `ingester-sinks`.

pub mod backoff;
pub mod config;
pub mod filter;
pub mod handler;
pub mod model;
pub mod reading_types;
pub mod transformer;

pub use backoff::Backoff;
pub use config::{Config, ConfigError, LocationConfig};
pub use filter::FilterEngine;
pub use handler::StateHandler;
pub use model::{CanonicalReading, DeploymentType, Measurement, RawEntityState, DATA_SOURCE};
pub use transformer::{ReadingTransformer, TransformError};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::backoff::Backoff;
    pub use crate::config::{Config, ConfigError, LocationConfig};
    pub use crate::filter::FilterEngine;
    pub use crate::handler::StateHandler;
    pub use crate::model::{CanonicalReading, Measurement, RawEntityState};
    pub use crate::transformer::{ReadingTransformer, TransformError};
}
