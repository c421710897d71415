use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide ingest counters and gauges, scraped on demand through
/// `/metrics`. Owned by the bootstrap and shared by `Arc`.
pub struct IngestMetrics {
    registry: Registry,
    ingested: IntCounter,
    failures: IntCounterVec,
    temperature: Gauge,
    humidity: Gauge,
    broker_connected: IntGauge,
}

impl IngestMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ingested = IntCounter::new("mqtt_messages_total", "Total MQTT messages received")?;
        let failures = IntCounterVec::new(
            Opts::new(
                "ingest_failures_total",
                "Messages dropped or left for redelivery, by source and reason",
            ),
            &["source", "reason"],
        )?;
        let temperature = Gauge::new(
            "sensor_temperature",
            "Current temperature reported by sensors",
        )?;
        let humidity = Gauge::new("sensor_humidity", "Current humidity reported by sensors")?;
        let broker_connected = IntGauge::new(
            "mqtt_broker_subscribed",
            "1 while the broker subscription is active",
        )?;

        registry.register(Box::new(ingested.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(temperature.clone()))?;
        registry.register(Box::new(humidity.clone()))?;
        registry.register(Box::new(broker_connected.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            ingested,
            failures,
            temperature,
            humidity,
            broker_connected,
        })
    }

    pub fn increment_ingested(&self) {
        self.ingested.inc();
    }

    pub fn ingested(&self) -> u64 {
        self.ingested.get()
    }

    pub fn record_failure(&self, source: &str, reason: &str) {
        self.failures.with_label_values(&[source, reason]).inc();
    }

    pub fn failures(&self, source: &str, reason: &str) -> u64 {
        self.failures.with_label_values(&[source, reason]).get()
    }

    pub fn set_temperature(&self, value: f64) {
        self.temperature.set(value);
    }

    pub fn set_humidity(&self, value: f64) {
        self.humidity.set(value);
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.get()
    }

    pub fn humidity(&self) -> f64 {
        self.humidity.get()
    }

    pub fn set_broker_subscribed(&self, subscribed: bool) {
        self.broker_connected.set(i64::from(subscribed));
    }

    pub fn broker_subscribed(&self) -> bool {
        self.broker_connected.get() == 1
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Text exposition of the registry at call time. Updates racing with the
    /// export may or may not be included.
    pub fn snapshot(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}
