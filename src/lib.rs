pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod metrics;
pub mod mqtt;
pub mod sqs;
pub mod store;
pub mod telemetry;
