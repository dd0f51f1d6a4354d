//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stream provisioning error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Durable consumer provisioning error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Subscribe error
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Operation did not complete in time
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether repeating the same call can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Publish(_) | Error::Timeout(_)
        )
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Timeout(5000).is_retryable());
        assert!(Error::Publish("no responders".to_string()).is_retryable());
        assert!(!Error::Stream("CORRIDAS: subjects overlap".to_string()).is_retryable());

        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!Error::from(bad_json).is_retryable());
    }
}
