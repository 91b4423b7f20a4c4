//! Store writer: one multi-row ClickHouse insert per flush.

use crate::sink::{Result, Sink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use ingester_core::config::ClickHouseOutputConfig;
use ingester_core::CanonicalReading;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Value of `network_source` for every row written by this gateway.
const NETWORK_SOURCE: &str = "HOMEASSISTANT";

/// Locations come from configuration, never from the device.
const LOCATION_SOURCE: &str = "CONFIG";

const UNKNOWN_TRANSPORT: &str = "UNKNOWN";

/// One row of the readings table.
#[derive(Debug, Clone, PartialEq, Row, Serialize)]
pub struct ReadingRow {
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub data_source: String,
    pub network_source: String,
    pub ingestion_node_id: String,
    pub reading_type: String,
    pub value: f64,
    pub unit: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub geo_country: String,
    pub geo_subdivision: String,
    pub board_model: String,
    pub deployment_type: String,
    pub transport_type: String,
    pub location_source: String,
    pub node_name: String,
}

impl ReadingRow {
    /// Row for the reading's measurement, or `None` if it has none.
    pub fn from_reading(reading: &CanonicalReading) -> Option<Self> {
        let measurement = reading.measurement()?;
        let timestamp = DateTime::<Utc>::from_timestamp(reading.timestamp, 0)?;
        let node_name = reading.node_name.clone().unwrap_or_default();

        Some(Self {
            timestamp,
            device_id: reading.device_id.clone(),
            data_source: reading.data_source.clone(),
            network_source: NETWORK_SOURCE.to_string(),
            ingestion_node_id: node_name.clone(),
            reading_type: measurement.reading_type.clone(),
            value: measurement.value,
            unit: measurement.unit.clone(),
            latitude: reading.latitude,
            longitude: reading.longitude,
            altitude: reading.altitude.unwrap_or(0.0),
            geo_country: reading.country_code.clone(),
            geo_subdivision: reading.subdivision_code.clone(),
            board_model: String::new(),
            deployment_type: reading
                .deployment_type
                .map(|d| d.as_str().to_string())
                .unwrap_or_default(),
            transport_type: UNKNOWN_TRANSPORT.to_string(),
            location_source: LOCATION_SOURCE.to_string(),
            node_name,
        })
    }
}

/// Writes reading batches to a ClickHouse table.
pub struct StoreWriter {
    client: Client,
    table: String,
}

impl StoreWriter {
    pub fn new(config: &ClickHouseOutputConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_user(&config.user)
            .with_password(&config.password)
            .with_database(&config.database);

        Self {
            client,
            table: config.table.clone(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Check the server is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }

    /// Ping at startup. An unreachable store is only a warning: flushes
    /// retry on their own.
    pub async fn check_connection(&self) {
        match self.ping().await {
            Ok(()) => info!(table = %self.table, "Connected to ClickHouse"),
            Err(e) => warn!(table = %self.table, error = %e, "ClickHouse not reachable yet"),
        }
    }
}

#[async_trait]
impl Sink for StoreWriter {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn flush(&self, batch: &[CanonicalReading]) -> Result<()> {
        let rows: Vec<ReadingRow> = batch.iter().filter_map(ReadingRow::from_reading).collect();
        if rows.is_empty() {
            return Ok(());
        }

        let mut insert = self.client.insert::<ReadingRow>(&self.table).await?;
        for row in &rows {
            insert.write(row).await?;
        }
        insert.end().await?;

        debug!(rows = rows.len(), table = %self.table, "Inserted reading batch");
        Ok(())
    }
}
