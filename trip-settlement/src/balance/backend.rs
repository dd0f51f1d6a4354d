//! Key-value backend seam under the balance store

use crate::error::StoreResult;
use async_trait::async_trait;
use std::time::Duration;

/// One write queued inside an optimistic transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

impl Write {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Write::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        }
    }

    pub fn set_with_ttl(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        Write::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Write::Delete { key: key.into() }
    }
}

/// Operations the balance store needs from a key-value store.
///
/// `watch` opens an optimistic transaction over a set of keys. Reads made
/// through the transaction see current values; `commit` applies all writes
/// atomically and returns `false` without writing anything if any watched key
/// changed since `watch`. A transaction that is not committed must be
/// passed to `release`.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    type Txn: Send;

    async fn watch(&self, keys: &[String]) -> StoreResult<Self::Txn>;

    async fn read(&self, txn: &mut Self::Txn, key: &str) -> StoreResult<Option<String>>;

    async fn commit(&self, txn: Self::Txn, writes: Vec<Write>) -> StoreResult<bool>;

    async fn release(&self, txn: Self::Txn);

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Returns whether the value was written
    async fn set_if_absent(&self, key: &str, value: &str) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Glob-style SCAN over the keyspace. No snapshot guarantee.
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;
}
