use crate::config::BrokerConfig;
use crate::ingest::{IngestSource, TelemetryIngestor};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, SubAck, SubscribeReasonCode, Transport};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Push-based ingestion: one subscription on the configured topic, each
/// publish persisted in arrival order by a single consumer task.
pub struct BrokerChannel {
    config: BrokerConfig,
    ingestor: TelemetryIngestor,
    shutdown_grace: Duration,
    state: ChannelState,
}

impl BrokerChannel {
    pub fn new(config: BrokerConfig, ingestor: TelemetryIngestor, shutdown_grace: Duration) -> Self {
        Self {
            config,
            ingestor,
            shutdown_grace,
            state: ChannelState::Disconnected,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn transition(&mut self, next: ChannelState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "broker channel state");
        self.state = next;
        self.ingestor
            .metrics()
            .set_broker_subscribed(next == ChannelState::Subscribed);
    }

    fn mqtt_options(&self) -> MqttOptions {
        let endpoint = &self.config.endpoint;
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            endpoint.host.clone(),
            endpoint.port,
        );
        options.set_keep_alive(self.config.keepalive());
        if let Some(username) = &endpoint.username {
            options.set_credentials(username.clone(), endpoint.password.clone().unwrap_or_default());
        }
        if endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let (tx, rx) = mpsc::channel::<Bytes>(self.config.inbox_capacity);
        let consumer = tokio::spawn(run_consumer(self.ingestor.clone(), rx));

        while !cancel.is_cancelled() {
            self.transition(ChannelState::Connecting);
            let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), 32);

            if let Err(err) = client
                .subscribe(self.config.topic.clone(), self.config.qos)
                .await
            {
                tracing::warn!(error=%err, topic=%self.config.topic, "failed to subscribe to MQTT topic; retrying");
                self.transition(ChannelState::Disconnected);
                if !self.wait_reconnect(&cancel).await {
                    break;
                }
                continue;
            }

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        tracing::info!(
                            host=%self.config.endpoint.host,
                            port=self.config.endpoint.port,
                            "connected to MQTT broker"
                        );
                    }
                    Ok(Event::Incoming(Incoming::SubAck(suback))) => {
                        if !subscription_granted(&suback) {
                            tracing::warn!(topic=%self.config.topic, codes=?suback.return_codes, "broker refused subscription; reconnecting");
                            break;
                        }
                        tracing::info!(topic=%self.config.topic, "subscribed to telemetry topic");
                        self.transition(ChannelState::Subscribed);
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if tx.send(publish.payload).await.is_err() {
                            tracing::error!("broker consumer stopped; dropping channel");
                            cancel.cancel();
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                        break;
                    }
                }
            }

            self.transition(ChannelState::Disconnected);
            if cancel.is_cancelled() {
                let _ = client.try_disconnect();
                break;
            }
            if !self.wait_reconnect(&cancel).await {
                break;
            }
        }

        self.transition(ChannelState::Disconnected);
        drop(tx);
        drain_consumer(consumer, self.shutdown_grace).await;
    }

    /// Returns false when cancelled while waiting.
    async fn wait_reconnect(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(self.config.reconnect_delay()) => true,
        }
    }
}

fn subscription_granted(suback: &SubAck) -> bool {
    !suback.return_codes.is_empty()
        && suback
            .return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
}

/// Waits for the consumer to empty the inbox. Past `grace` the task is
/// aborted so nothing writes to the store after shutdown. Returns true when
/// the inbox drained.
async fn drain_consumer(mut consumer: JoinHandle<()>, grace: Duration) -> bool {
    if tokio::time::timeout(grace, &mut consumer).await.is_ok() {
        return true;
    }
    consumer.abort();
    tracing::warn!("broker inbox not drained before shutdown; remaining messages dropped");
    false
}

async fn run_consumer(ingestor: TelemetryIngestor, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(payload) = rx.recv().await {
        handle_message(&ingestor, payload).await;
    }
}

/// Failures are logged and the message dropped; the broker does not
/// redeliver, so there is nothing to retry here.
pub async fn handle_message(ingestor: &TelemetryIngestor, payload: Bytes) {
    let mut payload = payload.to_vec();
    if let Err(err) = ingestor.ingest(IngestSource::Broker, &mut payload).await {
        tracing::warn!(error=%err, reason = err.reason(), "dropping MQTT message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerEndpoint;
    use crate::metrics::IngestMetrics;
    use crate::store::memory::MemoryStore;
    use crate::telemetry::normalize;
    use crate::store::{TelemetryStore, DEFAULT_RECENT_LIMIT};
    use rumqttc::QoS;
    use std::sync::Arc;

    fn ingestor() -> (TelemetryIngestor, Arc<MemoryStore>, Arc<IngestMetrics>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(IngestMetrics::new().unwrap());
        (
            TelemetryIngestor::new(store.clone(), metrics.clone()),
            store,
            metrics,
        )
    }

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            endpoint: BrokerEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1,
                tls: false,
                username: None,
                password: None,
            },
            topic: "iot/data".to_string(),
            client_id: "telemetry-ingest-test".to_string(),
            keepalive_secs: 5,
            qos: QoS::AtMostOnce,
            inbox_capacity: 8,
            reconnect_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn well_formed_message_is_persisted_and_counted() {
        let (ingestor, store, metrics) = ingestor();
        let body = r#"{"deviceId":"s1","temperature":21.5,"humidity":55}"#;

        handle_message(&ingestor, Bytes::from_static(body.as_bytes())).await;

        let records = store.recent(DEFAULT_RECENT_LIMIT).await.unwrap();
        assert_eq!(records.len(), 1);
        let mut expected = body.as_bytes().to_vec();
        assert_eq!(records[0].payload, normalize(&mut expected).unwrap());
        assert_eq!(metrics.ingested(), 1);
    }

    #[tokio::test]
    async fn unparseable_message_is_dropped() {
        let (ingestor, store, metrics) = ingestor();

        handle_message(&ingestor, Bytes::from_static(b"temperature=21.5")).await;

        assert_eq!(store.len(), 0);
        assert_eq!(metrics.ingested(), 0);
    }

    #[tokio::test]
    async fn storage_outage_drops_message_and_keeps_channel_usable() {
        let (ingestor, store, metrics) = ingestor();
        store.set_failing(true);
        handle_message(&ingestor, Bytes::from_static(br#"{"deviceId":"s1"}"#)).await;
        assert_eq!(metrics.ingested(), 0);

        store.set_failing(false);
        handle_message(&ingestor, Bytes::from_static(br#"{"deviceId":"s2"}"#)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(metrics.ingested(), 1);
        assert_eq!(store.payloads()[0].device_id(), Some("s2"));
    }

    #[tokio::test]
    async fn consumer_preserves_arrival_order() {
        let (ingestor, store, _metrics) = ingestor();
        let (tx, rx) = mpsc::channel(8);
        let consumer = tokio::spawn(run_consumer(ingestor, rx));
        for seq in 0..5 {
            tx.send(Bytes::from(format!(r#"{{"seq":{seq}}}"#))).await.unwrap();
        }
        drop(tx);
        consumer.await.unwrap();

        let seqs: Vec<i64> = store
            .payloads()
            .iter()
            .map(|p| p.fields()["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn run_stops_on_cancel_without_a_broker() {
        let (ingestor, _store, metrics) = ingestor();
        let channel = BrokerChannel::new(broker_config(), ingestor, Duration::from_millis(100));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(channel.run(cancel.clone()));

        sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("channel stops after cancel")
            .unwrap();
        assert!(!metrics.broker_subscribed());
    }

    #[test]
    fn refused_subscription_is_not_granted() {
        let granted = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        let refused = SubAck::new(1, vec![SubscribeReasonCode::Failure]);
        assert!(subscription_granted(&granted));
        assert!(!subscription_granted(&refused));
        assert!(!subscription_granted(&SubAck::new(1, Vec::new())));
    }

    #[tokio::test]
    async fn drain_waits_for_a_finished_consumer() {
        let (ingestor, store, _metrics) = ingestor();
        let (tx, rx) = mpsc::channel(8);
        let consumer = tokio::spawn(run_consumer(ingestor, rx));
        tx.send(Bytes::from_static(br#"{"deviceId":"s1"}"#)).await.unwrap();
        drop(tx);

        assert!(drain_consumer(consumer, Duration::from_secs(1)).await);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn drain_timeout_aborts_the_consumer() {
        let held = Arc::new(());
        let task_held = held.clone();
        let consumer = tokio::spawn(async move {
            let _held = task_held;
            sleep(Duration::from_secs(3600)).await;
        });

        assert!(!drain_consumer(consumer, Duration::from_millis(10)).await);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&held), 1);
    }
}
