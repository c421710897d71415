use super::{RecordId, TelemetryRecord, TelemetryStore};
use crate::config::DatabaseConfig;
use crate::error::IngestError;
use crate::telemetry::TelemetryPayload;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Clone)]
pub struct PgTelemetryStore {
    pool: PgPool,
}

impl PgTelemetryStore {
    /// Connects the pool and makes sure the `iot_data` table exists.
    pub async fn open(database: &DatabaseConfig, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(8))
            .connect_with(database.connect_options()?)
            .await
            .context("failed to connect to Postgres")?;
        let store = Self::from_pool(pool);
        store.ensure_schema().await?;
        tracing::info!("connected to Postgres");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS iot_data (
                id BIGSERIAL PRIMARY KEY,
                received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                payload JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create iot_data")?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS iot_data_received_at_idx ON iot_data (received_at DESC, id DESC)",
        )
        .execute(&self.pool)
        .await
        .context("create iot_data_received_at_idx")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn insert(&self, payload: &TelemetryPayload) -> Result<RecordId, IngestError> {
        let id: i64 = sqlx::query_scalar("INSERT INTO iot_data (payload) VALUES ($1) RETURNING id")
            .bind(Json(payload))
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn recent(&self, limit: u32) -> Result<Vec<TelemetryRecord>, IngestError> {
        let rows = sqlx::query(
            r#"
            SELECT id, received_at, payload
            FROM iot_data
            ORDER BY received_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(payload) = row.try_get::<Json<TelemetryPayload>, _>("payload")?;
            records.push(TelemetryRecord {
                id: row.try_get::<i64, _>("id")?,
                received_at: row.try_get::<DateTime<Utc>, _>("received_at")?,
                payload,
            });
        }
        Ok(records)
    }
}
