//! NATS connection and JetStream provisioning

use crate::{
    metrics::NATS_CONNECTION_STATUS,
    types::{StreamSpec, SubscriberConfig},
    Error, Result,
};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    Context as JetStreamContext,
};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Connection settings
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Client name reported to the server
    pub client_name: String,

    /// Timeout for establishing the connection
    pub connect_timeout: Duration,

    /// Timeout for request/reply and JetStream API calls
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: "trip-settlement".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to one NATS connection and its JetStream context.
///
/// Constructed once at process start and shared behind an `Arc`.
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: JetStreamContext,
    request_timeout: Duration,
}

impl NatsClient {
    /// Connect to the server
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let client = async_nats::ConnectOptions::new()
            .name(config.client_name.clone())
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout))
            .connect(config.url.as_str())
            .await
            .map_err(|e| {
                NATS_CONNECTION_STATUS.with_label_values(&["failed"]).inc();
                Error::Connection(e.to_string())
            })?;

        NATS_CONNECTION_STATUS.with_label_values(&["connected"]).inc();
        info!("✅ Connected to NATS: {}", config.url);

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            request_timeout: config.request_timeout,
        })
    }

    /// Core NATS client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// JetStream context
    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    /// Create the stream if it does not exist yet
    pub async fn ensure_stream(&self, spec: &StreamSpec) -> Result<jetstream::stream::Stream> {
        let config = StreamConfig {
            name: spec.name.clone(),
            description: Some(format!("Stream for {}", spec.subjects.join(", "))),
            subjects: spec.subjects.clone(),
            retention: RetentionPolicy::WorkQueue,
            max_age: spec.max_age,
            storage: StorageType::File,
            num_replicas: spec.replicas,
            duplicate_window: spec.duplicate_window,
            ..Default::default()
        };

        let stream = self
            .bounded(self.jetstream.get_or_create_stream(config))
            .await?
            .map_err(|e| Error::Stream(format!("{}: {}", spec.name, e)))?;

        info!("Stream {} ready (subjects: {:?})", spec.name, spec.subjects);
        Ok(stream)
    }

    /// Get the durable pull consumer, creating it on first use.
    ///
    /// Every process using the same `durable_name` shares one consumer, so
    /// the broker load-balances messages between them.
    pub async fn ensure_durable_consumer(
        &self,
        spec: &StreamSpec,
        config: &SubscriberConfig,
    ) -> Result<PullConsumer> {
        let stream = self.ensure_stream(spec).await?;

        if let Ok(Ok(consumer)) = self
            .bounded(stream.get_consumer::<pull::Config>(&config.durable_name))
            .await
        {
            info!(
                "Using existing durable consumer {} on {}",
                config.durable_name, spec.name
            );
            return Ok(consumer);
        }

        info!(
            "Consumer {} not found on {}, creating...",
            config.durable_name, spec.name
        );

        let consumer_config = pull::Config {
            durable_name: Some(config.durable_name.clone()),
            description: Some(format!("Durable consumer for {}", config.filter_subject)),
            filter_subject: config.filter_subject.clone(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };

        self.bounded(stream.create_consumer(consumer_config))
            .await?
            .map_err(|e| Error::Consumer(format!("{}: {}", config.durable_name, e)))
    }

    /// Flush pending publishes before the handle is dropped
    pub async fn close(&self) -> Result<()> {
        self.bounded(self.client.flush())
            .await?
            .map_err(|e| Error::Connection(e.to_string()))?;

        NATS_CONNECTION_STATUS.with_label_values(&["closed"]).inc();
        info!("NATS connection flushed");
        Ok(())
    }

    async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| {
                warn!("NATS call exceeded {:?}", self.request_timeout);
                Error::Timeout(self.request_timeout.as_millis() as u64)
            })
    }
}
