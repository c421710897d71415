mod postgres;

#[cfg(test)]
pub(crate) mod memory;

pub use postgres::PgTelemetryStore;

use crate::error::IngestError;
use crate::telemetry::TelemetryPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEFAULT_RECENT_LIMIT: u32 = 100;

pub type RecordId = i64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub id: RecordId,
    pub received_at: DateTime<Utc>,
    pub payload: TelemetryPayload,
}

/// Append-only record store shared by both ingestion paths and the query API.
///
/// Inserts are not idempotent: a redelivered message becomes a second record.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Appends one record and returns the id assigned by the store. The
    /// record is visible to `recent` once this returns `Ok`.
    async fn insert(&self, payload: &TelemetryPayload) -> Result<RecordId, IngestError>;

    /// Up to `limit` records, newest `received_at` first.
    async fn recent(&self, limit: u32) -> Result<Vec<TelemetryRecord>, IngestError>;
}
