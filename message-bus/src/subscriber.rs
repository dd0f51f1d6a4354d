//! Durable JetStream subscriber with bounded concurrency

use crate::{
    client::NatsClient,
    metrics::{MESSAGE_ACK_FAILURES, MESSAGE_PROCESS_DURATION, MESSAGE_RECEIVE_TOTAL},
    types::{Delivery, Disposition, StreamSpec, SubscriberConfig},
    Error, Result,
};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Message handler trait
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivery and decide how the broker should treat it
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// Message subscriber
pub struct Subscriber {
    client: Arc<NatsClient>,
    stream: StreamSpec,
    config: SubscriberConfig,
}

impl Subscriber {
    /// Create new subscriber
    pub fn new(client: Arc<NatsClient>, stream: StreamSpec, config: SubscriberConfig) -> Self {
        Self {
            client,
            stream,
            config,
        }
    }

    /// Subscriber configuration
    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Pull and dispatch messages until `shutdown` flips to `true`.
    ///
    /// Up to `max_concurrent` handlers run at once. On shutdown no new
    /// message is pulled, and the call returns only after every handler that
    /// already started has finished and its message has been acknowledged.
    pub async fn run<H>(&self, handler: Arc<H>, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        let consumer = self
            .client
            .ensure_durable_consumer(&self.stream, &self.config)
            .await?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        let slots = self.config.max_concurrent.max(1);
        let permits = Arc::new(Semaphore::new(slots));

        info!(
            "📡 Consuming {} from stream {} (durable: {}, concurrency: {})",
            self.config.filter_subject, self.stream.name, self.config.durable_name, slots
        );

        while !*shutdown.borrow() {
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = messages.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let handler = handler.clone();
                    let label = self.config.filter_subject.clone();
                    let retry_delay = self.config.retry_delay;

                    tokio::spawn(async move {
                        dispatch(handler.as_ref(), message, &label, retry_delay).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    warn!("Error receiving message: {}", e);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                None => {
                    warn!("⚠️ JetStream message stream ended");
                    break;
                }
            }
        }

        info!("Subscriber stopping, waiting for in-flight messages");
        let _drained = permits
            .acquire_many(slots as u32)
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;
        info!("Subscriber stopped");

        Ok(())
    }
}

async fn dispatch<H>(handler: &H, message: jetstream::Message, label: &str, retry_delay: Duration)
where
    H: MessageHandler + ?Sized,
{
    let start = Instant::now();
    let attempt = message.info().map(|info| info.delivered).unwrap_or(1);

    let delivery = Delivery {
        subject: message.subject.to_string(),
        payload: message.payload.clone(),
        attempt,
    };

    let disposition = handler.handle(&delivery).await;
    debug!(attempt, disposition = disposition.as_label(), "Handler finished");

    let acked = match disposition {
        Disposition::Ack => message.ack().await,
        Disposition::Retry => message.ack_with(AckKind::Nak(Some(retry_delay))).await,
        Disposition::Drop => message.ack_with(AckKind::Term).await,
    };

    if let Err(e) = acked {
        // Unacknowledged messages come back after ack_wait
        error!(
            "Failed to {} message on {}: {}",
            disposition.as_label(),
            delivery.subject,
            e
        );
        MESSAGE_ACK_FAILURES
            .with_label_values(&[disposition.as_label()])
            .inc();
    }

    MESSAGE_RECEIVE_TOTAL
        .with_label_values(&[label, disposition.as_label()])
        .inc();
    MESSAGE_PROCESS_DURATION
        .with_label_values(&[label])
        .observe(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NatsConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, delivery: &Delivery) -> Disposition {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if delivery.payload.is_empty() {
                Disposition::Drop
            } else {
                Disposition::Ack
            }
        }
    }

    #[tokio::test]
    async fn test_handler_contract() {
        let handler = CountingHandler {
            seen: AtomicUsize::new(0),
        };

        let empty = Delivery::new("corridas_finalizadas", Vec::new());
        let full = Delivery::new("corridas_finalizadas", b"{}".to_vec());

        assert_eq!(handler.handle(&empty).await, Disposition::Drop);
        assert_eq!(handler.handle(&full).await, Disposition::Ack);
        assert_eq!(handler.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream enabled
    async fn test_run_stops_on_shutdown() {
        let client = Arc::new(
            NatsClient::connect(&NatsConfig::default())
                .await
                .expect("Failed to connect"),
        );
        let subscriber = Subscriber::new(
            client,
            StreamSpec::single("TEST_SHUTDOWN", "test_shutdown"),
            SubscriberConfig {
                durable_name: "test-shutdown".to_string(),
                filter_subject: "test_shutdown".to_string(),
                ..Default::default()
            },
        );

        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
        });
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn(async move { subscriber.run(handler, rx).await });
        tx.send(true).expect("Subscriber dropped");

        run.await.expect("Task panicked").expect("Subscriber failed");
    }
}
