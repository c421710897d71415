use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry_ingest::config::Config;
use telemetry_ingest::http::{self, HttpState};
use telemetry_ingest::ingest::TelemetryIngestor;
use telemetry_ingest::metrics::IngestMetrics;
use telemetry_ingest::mqtt::BrokerChannel;
use telemetry_ingest::sqs::{QueueConsumer, SqsQueue};
use telemetry_ingest::store::PgTelemetryStore;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let store = Arc::new(PgTelemetryStore::open(&config.database, config.db_pool_size).await?);
    let metrics = Arc::new(IngestMetrics::new().context("failed to register metrics")?);
    let ingestor = TelemetryIngestor::new(store.clone(), metrics.clone());
    let cancel = CancellationToken::new();

    let broker = BrokerChannel::new(
        config.broker.clone(),
        ingestor.clone(),
        config.shutdown_grace(),
    );
    let broker_handle = tokio::spawn(broker.run(cancel.clone()));

    let queue_handle = match &config.queue {
        Some(queue_config) => {
            tracing::info!(queue=%queue_config.queue_url, region=%queue_config.region, "SQS consumption enabled");
            let queue = SqsQueue::connect(queue_config).await;
            let consumer = QueueConsumer::new(queue, ingestor.clone(), queue_config);
            Some(tokio::spawn(consumer.run(cancel.clone())))
        }
        None => None,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    tracing::info!(%addr, "telemetry-ingest HTTP listening");
    let app = http::router(HttpState {
        store: store.clone(),
        metrics,
    });
    let http_cancel = cancel.clone();
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = &mut http_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("HTTP server exited"),
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server failed"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
            }
        }
    }

    cancel.cancel();
    let grace = config.shutdown_grace();
    await_shutdown("broker channel", broker_handle, grace).await;
    if let Some(handle) = queue_handle {
        await_shutdown("queue consumer", handle, grace).await;
    }
    if !http_handle.is_finished() {
        await_shutdown("HTTP server", http_handle, grace).await;
    }
    store.close().await;

    Ok(())
}

async fn await_shutdown<T>(name: &str, handle: JoinHandle<T>, grace: std::time::Duration) {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(_)) => tracing::info!(task = name, "stopped"),
        Ok(Err(err)) => tracing::warn!(task = name, error=%err, "task failed during shutdown"),
        Err(_) => tracing::warn!(task = name, "did not stop within the shutdown grace period"),
    }
}
