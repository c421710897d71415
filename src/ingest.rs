use crate::error::IngestError;
use crate::metrics::IngestMetrics;
use crate::store::{RecordId, TelemetryStore};
use crate::telemetry::{normalize, TelemetryPayload, HUMIDITY_FIELD, TEMPERATURE_FIELD};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestSource {
    Broker,
    Queue,
}

impl IngestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestSource::Broker => "broker",
            IngestSource::Queue => "queue",
        }
    }
}

impl fmt::Display for IngestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The normalize -> persist -> observe step shared by both ingestion paths.
#[derive(Clone)]
pub struct TelemetryIngestor {
    store: Arc<dyn TelemetryStore>,
    metrics: Arc<IngestMetrics>,
}

impl TelemetryIngestor {
    pub fn new(store: Arc<dyn TelemetryStore>, metrics: Arc<IngestMetrics>) -> Self {
        Self { store, metrics }
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// Metrics move only once the store has acknowledged the insert; a
    /// failed message leaves the ingest counter and gauges untouched.
    pub async fn ingest(
        &self,
        source: IngestSource,
        raw: &mut [u8],
    ) -> Result<RecordId, IngestError> {
        let result = self.persist(source, raw).await;
        if let Err(err) = &result {
            self.metrics.record_failure(source.as_str(), err.reason());
        }
        result
    }

    async fn persist(&self, source: IngestSource, raw: &mut [u8]) -> Result<RecordId, IngestError> {
        let payload = normalize(raw)?;
        let id = self.store.insert(&payload).await?;

        self.metrics.increment_ingested();
        // Sensor gauges follow the queue feed only; broker readings just count.
        if source == IngestSource::Queue {
            self.update_sensor_gauges(&payload);
        }

        tracing::debug!(
            id,
            source = %source,
            device = payload.device_id().unwrap_or("-"),
            "persisted telemetry"
        );
        Ok(id)
    }

    fn update_sensor_gauges(&self, payload: &TelemetryPayload) {
        match payload.reading(TEMPERATURE_FIELD) {
            Some(value) => self.metrics.set_temperature(value),
            None => tracing::debug!("queue payload has no numeric temperature"),
        }
        match payload.reading(HUMIDITY_FIELD) {
            Some(value) => self.metrics.set_humidity(value),
            None => tracing::debug!("queue payload has no numeric humidity"),
        }
    }
}
