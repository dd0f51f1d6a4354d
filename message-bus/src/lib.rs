//! Message Bus with NATS JetStream support
//!
//! Provides durable, acknowledged messaging with:
//! - Stream provisioning with a de-duplication window
//! - Shared durable pull consumers for load balancing across instances
//! - Explicit per-message dispositions (ack / redeliver / terminate)
//! - Graceful shutdown that drains in-flight handlers
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod error;
pub mod metrics;
pub mod publisher;
pub mod subscriber;
pub mod types;

pub use client::{NatsClient, NatsConfig};
pub use error::{Error, Result};
pub use publisher::{PublishReceipt, Publisher, PublisherConfig};
pub use subscriber::{MessageHandler, Subscriber};
pub use types::{Delivery, Disposition, StreamSpec, SubscriberConfig};
