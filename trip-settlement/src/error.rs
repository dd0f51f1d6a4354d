//! Error types for trip settlement

use thiserror::Error;

/// Result type for the crate's top-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for balance store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for trip ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Balance store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Key-value store unreachable or a call timed out
    #[error("Balance store unavailable: {0}")]
    Unavailable(String),

    /// Optimistic retry loop gave up on a contended key
    #[error("Gave up on {key} after {attempts} conflicting attempts")]
    ConcurrencyExhausted { key: String, attempts: u32 },

    /// A balance key holds something that is not a decimal
    #[error("Balance {key} holds a non-decimal value: {value:?}")]
    CorruptBalance { key: String, value: String },

    /// The new balance would not fit in a decimal
    #[error("Balance {key} would overflow")]
    Overflow { key: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Trip ledger failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Document store unreachable or a call timed out
    #[error("Trip ledger unavailable: {0}")]
    Unavailable(String),

    /// The document store rejected the update
    #[error("Trip ledger rejected update: {0}")]
    Rejected(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => LedgerError::Unavailable(err.to_string()),
            other => LedgerError::Rejected(other.to_string()),
        }
    }
}

/// Top-level errors surfaced by the binaries
#[derive(Error, Debug)]
pub enum Error {
    /// Balance store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Trip ledger error
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Broker error
    #[error("Message bus error: {0}")]
    MessageBus(#[from] message_bus::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
