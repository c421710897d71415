use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use rumqttc::QoS;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_BROKER_URL: &str = "mqtt://localhost:1883";
const DEFAULT_TOPIC: &str = "iot/data";
const DEFAULT_REGION: &str = "eu-west-1";
const SQS_MAX_BATCH: i32 = 10;
const SQS_MAX_WAIT_SECONDS: i32 = 20;

#[derive(Clone, Debug)]
pub struct Config {
    pub broker: BrokerConfig,
    pub queue: Option<QueueConfig>,
    pub database: DatabaseConfig,
    pub db_pool_size: u32,
    pub http_port: u16,
    pub shutdown_grace_ms: u64,
    pub otlp_endpoint: Option<String>,
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub endpoint: BrokerEndpoint,
    pub topic: String,
    pub client_id: String,
    pub keepalive_secs: u64,
    pub qos: QoS,
    pub inbox_capacity: usize,
    pub reconnect_delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub queue_url: String,
    pub region: String,
    pub batch_size: i32,
    pub wait_time_seconds: i32,
    pub error_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub enum DatabaseConfig {
    Url(String),
    Parts {
        host: String,
        port: u16,
        user: String,
        password: Option<String>,
        database: String,
        ssl_mode: String,
    },
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let broker_url = env_string("MQTT_BROKER_URL").unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());
        let endpoint = BrokerEndpoint::parse(&broker_url)?;
        let topic = env_string("MQTT_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let client_id = env_string("MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("telemetry-ingest-{}", std::process::id()));
        let qos = match env_parse::<u8>("MQTT_QOS").unwrap_or(0) {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => bail!("MQTT_QOS must be 0, 1 or 2 (got {other})"),
        };
        let broker = BrokerConfig {
            endpoint,
            topic,
            client_id,
            keepalive_secs: env_parse("MQTT_KEEPALIVE_SECS").unwrap_or(30),
            qos,
            inbox_capacity: env_parse::<usize>("MQTT_INBOX_CAPACITY")
                .unwrap_or(1024)
                .max(1),
            reconnect_delay_ms: env_parse("MQTT_RECONNECT_DELAY_MS").unwrap_or(1000),
        };

        let queue = if env_flag("CONSUME_SQS") {
            let queue_url = env_string("AWS_SQS_URL")
                .context("AWS_SQS_URL is required when CONSUME_SQS is enabled")?;
            Some(QueueConfig {
                queue_url,
                region: env_string("AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
                batch_size: env_parse::<i32>("SQS_BATCH_SIZE")
                    .unwrap_or(SQS_MAX_BATCH)
                    .clamp(1, SQS_MAX_BATCH),
                wait_time_seconds: env_parse::<i32>("SQS_WAIT_TIME_SECONDS")
                    .unwrap_or(SQS_MAX_WAIT_SECONDS)
                    .clamp(0, SQS_MAX_WAIT_SECONDS),
                error_delay_ms: env_parse("SQS_ERROR_DELAY_MS").unwrap_or(1000),
            })
        } else {
            None
        };

        let database = match env_string("DATABASE_URL") {
            Some(url) => DatabaseConfig::Url(url),
            None => DatabaseConfig::Parts {
                host: env_string("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: env_parse("DB_PORT").unwrap_or(5432),
                user: env_string("DB_USER").unwrap_or_else(|| "postgres".to_string()),
                password: env_string("DB_PASSWORD"),
                database: env_string("DB_NAME").unwrap_or_else(|| "postgres".to_string()),
                ssl_mode: env_string("DB_SSL_MODE").unwrap_or_else(|| "require".to_string()),
            },
        };

        Ok(Self {
            broker,
            queue,
            database,
            db_pool_size: env_parse("DB_POOL_SIZE").unwrap_or(10),
            http_port: env_parse("PORT").unwrap_or(3000),
            shutdown_grace_ms: env_parse("SHUTDOWN_GRACE_MS").unwrap_or(5000),
            otlp_endpoint: env_string("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl BrokerConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl QueueConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_seconds.max(0) as u64)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }
}

impl BrokerEndpoint {
    /// Accepts `mqtt://`, `tcp://`, `mqtts://` and `ssl://` URLs, with
    /// optional `user:password@` credentials.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim()).with_context(|| format!("invalid MQTT broker URL {raw:?}"))?;
        let (tls, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (false, 1883),
            "mqtts" | "ssl" => (true, 8883),
            other => bail!("unsupported MQTT broker scheme {other:?}"),
        };
        let host = url
            .host_str()
            .map(str::to_string)
            .filter(|host| !host.is_empty())
            .with_context(|| format!("MQTT broker URL {raw:?} has no host"))?;
        let username = Some(url.username().to_string()).filter(|user| !user.is_empty());
        let password = url.password().map(str::to_string);

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            tls,
            username,
            password,
        })
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        match self {
            DatabaseConfig::Url(url) => PgConnectOptions::from_str(url)
                .context("DATABASE_URL is not a valid Postgres connection string"),
            DatabaseConfig::Parts {
                host,
                port,
                user,
                password,
                database,
                ssl_mode,
            } => {
                let ssl_mode = PgSslMode::from_str(ssl_mode)
                    .with_context(|| format!("invalid DB_SSL_MODE {ssl_mode:?}"))?;
                let mut options = PgConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .username(user)
                    .database(database)
                    .ssl_mode(ssl_mode);
                if let Some(password) = password {
                    options = options.password(password);
                }
                Ok(options)
            }
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}

fn env_flag(key: &str) -> bool {
    env_string(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
