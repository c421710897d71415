use crate::config::QueueConfig;
use crate::error::IngestError;
use crate::ingest::{IngestSource, TelemetryIngestor};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::Client as SqsClient;
use aws_types::region::Region;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    pub receipt_handle: Option<String>,
    pub body: Option<String>,
}

/// Pull-based message source with explicit acknowledgement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Long-polls for up to `max_messages`, waiting at most `wait`.
    async fn receive(&self, max_messages: i32, wait: Duration) -> Result<Vec<QueueMessage>, IngestError>;

    /// Acknowledges a message so the queue does not redeliver it.
    async fn delete(&self, receipt_handle: &str) -> Result<(), IngestError>;
}

pub struct SqsQueue {
    client: SqsClient,
    queue_url: String,
}

impl SqsQueue {
    pub async fn connect(config: &QueueConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;
        Self {
            client: SqsClient::new(&sdk_config),
            queue_url: config.queue_url.clone(),
        }
    }
}

#[async_trait]
impl QueueSource for SqsQueue {
    async fn receive(&self, max_messages: i32, wait: Duration) -> Result<Vec<QueueMessage>, IngestError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait.as_secs() as i32)
            .send()
            .await
            .map_err(|err| IngestError::Transport(DisplayErrorContext(&err).to_string()))?;

        Ok(output
            .messages()
            .iter()
            .map(|message| QueueMessage {
                message_id: message.message_id().map(str::to_string),
                receipt_handle: message.receipt_handle().map(str::to_string),
                body: message.body().map(str::to_string),
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), IngestError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|err| IngestError::Transport(DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub received: usize,
    pub persisted: usize,
    pub deleted: usize,
}

/// Single-worker long-poll loop. A message is deleted only after its record
/// is persisted; anything else is left for the queue to redeliver.
pub struct QueueConsumer<Q> {
    queue: Q,
    ingestor: TelemetryIngestor,
    batch_size: i32,
    wait: Duration,
    error_delay: Duration,
}

impl<Q: QueueSource> QueueConsumer<Q> {
    pub fn new(queue: Q, ingestor: TelemetryIngestor, config: &QueueConfig) -> Self {
        Self {
            queue,
            ingestor,
            batch_size: config.batch_size,
            wait: config.wait_time(),
            error_delay: config.error_delay(),
        }
    }

    /// Cancellation interrupts the long poll or the error back-off; a batch
    /// that has been received is always processed to the end.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(batch_size = self.batch_size, wait_secs = self.wait.as_secs(), "queue consumer started");
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive(self.batch_size, self.wait) => received,
            };
            match received {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    let outcome = self.process_batch(messages).await;
                    tracing::debug!(
                        received = outcome.received,
                        persisted = outcome.persisted,
                        deleted = outcome.deleted,
                        "processed queue batch"
                    );
                }
                Err(err) => {
                    tracing::warn!(error=%err, "failed to poll queue");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.error_delay) => {}
                    }
                }
            }
        }
        tracing::info!("queue consumer stopped");
    }

    /// One receive plus sequential processing of the returned batch. Only a
    /// receive failure is returned; per-message failures are logged and
    /// reflected in the outcome counts.
    pub async fn poll_once(&self) -> Result<BatchOutcome, IngestError> {
        let messages = self.queue.receive(self.batch_size, self.wait).await?;
        Ok(self.process_batch(messages).await)
    }

    async fn process_batch(&self, messages: Vec<QueueMessage>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            received: messages.len(),
            ..BatchOutcome::default()
        };
        for message in messages {
            let (persisted, deleted) = self.process_message(message).await;
            outcome.persisted += usize::from(persisted);
            outcome.deleted += usize::from(deleted);
        }
        outcome
    }

    async fn process_message(&self, message: QueueMessage) -> (bool, bool) {
        let message_id = message.message_id.as_deref().unwrap_or("-");
        let mut body = message.body.clone().unwrap_or_default().into_bytes();

        if let Err(err) = self.ingestor.ingest(IngestSource::Queue, &mut body).await {
            tracing::warn!(
                error=%err,
                reason = err.reason(),
                message_id,
                "queue message not persisted; leaving it for redelivery"
            );
            return (false, false);
        }

        let Some(receipt_handle) = message.receipt_handle.as_deref() else {
            tracing::warn!(message_id, "queue message has no receipt handle; cannot delete");
            return (true, false);
        };
        match self.queue.delete(receipt_handle).await {
            Ok(()) => (true, true),
            Err(err) => {
                // The record stays; redelivery will produce a duplicate.
                tracing::warn!(error=%err, message_id, "failed to delete queue message");
                (true, false)
            }
        }
    }
}
