//! Type definitions for message bus

use bytes::Bytes;
use std::time::Duration;

/// What the subscriber does with a message once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processing finished; acknowledge so it is never redelivered.
    Ack,
    /// Transient failure; negatively acknowledge so the broker redelivers.
    Retry,
    /// Message can never succeed; terminate delivery without retrying.
    Drop,
}

impl Disposition {
    /// Metric label for this disposition
    pub fn as_label(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Retry => "retry",
            Disposition::Drop => "drop",
        }
    }
}

/// A message handed to a [`crate::MessageHandler`], detached from the NATS types.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the message was published on
    pub subject: String,

    /// Raw payload
    pub payload: Bytes,

    /// Delivery attempt, starting at 1
    pub attempt: i64,
}

impl Delivery {
    /// Build a first-attempt delivery
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            attempt: 1,
        }
    }

    /// Whether the broker already tried to deliver this message before
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// JetStream stream definition
#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// Stream name
    pub name: String,

    /// Subjects captured by the stream
    pub subjects: Vec<String>,

    /// How long unconsumed messages are retained
    pub max_age: Duration,

    /// Window in which publishes with the same `Nats-Msg-Id` are dropped
    pub duplicate_window: Duration,

    /// Replica count
    pub replicas: usize,
}

impl StreamSpec {
    /// Stream with a single subject and default retention
    pub fn single(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: vec![subject.into()],
            ..Default::default()
        }
    }
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            name: "CORRIDAS".to_string(),
            subjects: vec!["corridas_finalizadas".to_string()],
            max_age: Duration::from_secs(7 * 24 * 3600), // 7 days
            duplicate_window: Duration::from_secs(120),
            replicas: 1,
        }
    }
}

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Durable consumer name, shared by every instance of a service
    pub durable_name: String,

    /// Subject filter inside the stream
    pub filter_subject: String,

    /// Max messages handled concurrently by one process
    pub max_concurrent: usize,

    /// Time the broker waits for an ack before redelivering
    pub ack_wait: Duration,

    /// Max delivery attempts (-1 for unlimited)
    pub max_deliver: i64,

    /// Delay requested when a message is negatively acknowledged
    pub retry_delay: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            durable_name: "settlement-consumer".to_string(),
            filter_subject: "corridas_finalizadas".to_string(),
            max_concurrent: 16,
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_labels() {
        assert_eq!(Disposition::Ack.as_label(), "ack");
        assert_eq!(Disposition::Retry.as_label(), "retry");
        assert_eq!(Disposition::Drop.as_label(), "drop");
    }

    #[test]
    fn test_delivery_redelivery_flag() {
        let mut delivery = Delivery::new("corridas_finalizadas", b"{}".to_vec());
        assert!(!delivery.is_redelivery());

        delivery.attempt = 3;
        assert!(delivery.is_redelivery());
    }

    #[test]
    fn test_single_subject_stream() {
        let spec = StreamSpec::single("TRIPS", "trips.completed");
        assert_eq!(spec.name, "TRIPS");
        assert_eq!(spec.subjects, vec!["trips.completed".to_string()]);
        assert_eq!(spec.duplicate_window, Duration::from_secs(120));
    }
}
