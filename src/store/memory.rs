use super::{RecordId, TelemetryRecord, TelemetryStore};
use crate::error::IngestError;
use crate::telemetry::TelemetryPayload;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Test double for the Postgres store. `set_failing(true)` makes every call
/// fail the way an unreachable database would.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: Mutex<Vec<TelemetryRecord>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub(crate) fn payloads(&self) -> Vec<TelemetryPayload> {
        self.records
            .lock()
            .map(|records| records.iter().map(|r| r.payload.clone()).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), IngestError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IngestError::StorageUnavailable(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert(&self, payload: &TelemetryPayload) -> Result<RecordId, IngestError> {
        self.check_available()?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| IngestError::StorageUnavailable(sqlx::Error::PoolClosed))?;
        let id = records.last().map(|r| r.id + 1).unwrap_or(1);
        records.push(TelemetryRecord {
            id,
            received_at: Utc::now(),
            payload: payload.clone(),
        });
        Ok(id)
    }

    async fn recent(&self, limit: u32) -> Result<Vec<TelemetryRecord>, IngestError> {
        self.check_available()?;
        let records = self
            .records
            .lock()
            .map_err(|_| IngestError::StorageUnavailable(sqlx::Error::PoolClosed))?;
        let mut out: Vec<TelemetryRecord> = records.clone();
        out.sort_by(|a, b| {
            b.received_at
                .cmp(&a.received_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        out.truncate(limit as usize);
        Ok(out)
    }
}
