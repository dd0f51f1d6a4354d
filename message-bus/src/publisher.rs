//! Message publisher with retry logic

use crate::{
    client::NatsClient,
    metrics::{MESSAGE_PUBLISH_DURATION, MESSAGE_PUBLISH_TOTAL},
    types::StreamSpec,
    Error, Result,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Header JetStream uses to drop duplicate publishes
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Publish timeout, including the JetStream acknowledgement
    pub publish_timeout: Duration,

    /// Max retry attempts
    pub max_retry_attempts: u32,

    /// Initial retry delay
    pub initial_retry_delay: Duration,

    /// Max retry delay
    pub max_retry_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Outcome of a persisted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Stream sequence assigned to the message
    pub sequence: u64,

    /// The stream already held a message with the same id
    pub duplicate: bool,
}

/// Message publisher
pub struct Publisher {
    client: Arc<NatsClient>,
    stream: StreamSpec,
    config: PublisherConfig,
}

impl Publisher {
    /// Create new publisher
    pub fn new(client: Arc<NatsClient>, stream: StreamSpec, config: PublisherConfig) -> Self {
        Self {
            client,
            stream,
            config,
        }
    }

    /// Publish a JSON payload, de-duplicated by `msg_id` inside the stream's
    /// duplicate window.
    pub async fn publish_json<T: serde::Serialize>(
        &self,
        subject: &str,
        msg_id: &str,
        payload: &T,
    ) -> Result<PublishReceipt> {
        let bytes = serde_json::to_vec(payload)?;
        self.publish(subject, msg_id, Bytes::from(bytes)).await
    }

    /// Publish raw bytes
    pub async fn publish(&self, subject: &str, msg_id: &str, payload: Bytes) -> Result<PublishReceipt> {
        let start = Instant::now();

        self.client.ensure_stream(&self.stream).await?;

        info!("Publishing message {} to subject: {}", msg_id, subject);

        let result = self.publish_with_retry(subject, msg_id, payload).await;

        MESSAGE_PUBLISH_DURATION
            .with_label_values(&[subject])
            .observe(start.elapsed().as_secs_f64());

        let status = match &result {
            Ok(receipt) if receipt.duplicate => "duplicate",
            Ok(_) => "success",
            Err(_) => "error",
        };
        MESSAGE_PUBLISH_TOTAL
            .with_label_values(&[subject, status])
            .inc();

        result
    }

    /// Publish with exponential backoff retry
    async fn publish_with_retry(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Bytes,
    ) -> Result<PublishReceipt> {
        let mut attempts = 0;
        let mut delay = self.config.initial_retry_delay;

        loop {
            attempts += 1;

            match self.publish_once(subject, msg_id, payload.clone()).await {
                Ok(receipt) => {
                    if attempts > 1 {
                        info!("✅ Message published after {} attempts", attempts);
                    }
                    return Ok(receipt);
                }
                Err(e) => {
                    if !e.is_retryable() || attempts >= self.config.max_retry_attempts {
                        error!("❌ Failed to publish after {} attempts: {}", attempts, e);
                        return Err(e);
                    }

                    warn!(
                        "⚠️  Publish failed (attempt {}), retrying in {:?}: {}",
                        attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;

                    delay = (delay * 2).min(self.config.max_retry_delay);
                }
            }
        }
    }

    /// Single publish attempt, waiting for the stream's acknowledgement
    async fn publish_once(&self, subject: &str, msg_id: &str, payload: Bytes) -> Result<PublishReceipt> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, msg_id);

        let publish = async {
            let ack = self
                .client
                .jetstream()
                .publish_with_headers(subject.to_string(), headers, payload)
                .await
                .map_err(|e| Error::Publish(e.to_string()))?;

            ack.await
                .map_err(|e| Error::Publish(format!("Publish ack failed: {}", e)))
        };

        let ack = tokio::time::timeout(self.config.publish_timeout, publish)
            .await
            .map_err(|_| Error::Timeout(self.config.publish_timeout.as_millis() as u64))??;

        Ok(PublishReceipt {
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }
}
