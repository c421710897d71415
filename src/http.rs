use crate::metrics::IngestMetrics;
use crate::store::{TelemetryRecord, TelemetryStore, DEFAULT_RECENT_LIMIT};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn TelemetryStore>,
    pub metrics: Arc<IngestMetrics>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct DataQuery {
    limit: Option<u32>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn recent_data(
    State(state): State<HttpState>,
    Query(query): Query<DataQuery>,
) -> Result<Json<Vec<TelemetryRecord>>, (StatusCode, Json<serde_json::Value>)> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, DEFAULT_RECENT_LIMIT);
    let records = state.store.recent(limit).await.map_err(|err| {
        tracing::error!(error=%err, "failed to fetch recent telemetry");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to fetch data" })),
        )
    })?;
    Ok(Json(records))
}

async fn metrics(State(state): State<HttpState>) -> Response {
    match state.metrics.snapshot() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error=%err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

fn api_routes() -> Router<HttpState> {
    Router::new()
        .route("/data", get(recent_data))
        .route("/health", get(health))
}

/// `/data` and `/health` are served both at the root and under `/api`.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .merge(api_routes())
        .nest("/api", api_routes())
        .route("/metrics", get(metrics))
        .with_state(state)
}
