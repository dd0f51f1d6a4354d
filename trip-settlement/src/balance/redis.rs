//! Redis backend for the balance store

use super::backend::{KvBackend, Write};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, RedisResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Redis-backed key-value store.
///
/// Plain commands share one `ConnectionManager`. WATCH state belongs to a
/// connection, so every optimistic transaction checks out a connection of its
/// own from a small idle pool and returns it once EXEC or UNWATCH has run.
pub struct RedisBackend {
    client: redis::Client,
    shared: ConnectionManager,
    idle: Mutex<Vec<MultiplexedConnection>>,
    max_idle: usize,
    command_timeout: Duration,
}

/// A connection holding WATCHed keys
pub struct RedisTxn {
    conn: MultiplexedConnection,
    broken: bool,
}

impl RedisBackend {
    pub async fn connect(url: &str, command_timeout: Duration, max_idle: usize) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let shared = bounded(command_timeout, ConnectionManager::new(client.clone())).await?;

        info!("Connected to Redis at {}", redact(url));

        Ok(Self {
            client,
            shared,
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            command_timeout,
        })
    }

    /// Drop pooled transaction connections
    pub fn close(&self) {
        let drained = {
            let mut idle = self.idle.lock();
            std::mem::take(&mut *idle)
        };
        debug!("Closed {} idle Redis transaction connections", drained.len());
    }

    async fn call<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        bounded(self.command_timeout, fut).await
    }

    async fn checkout(&self) -> StoreResult<MultiplexedConnection> {
        let pooled = self.idle.lock().pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => {
                self.call(self.client.get_multiplexed_tokio_connection())
                    .await
            }
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    type Txn = RedisTxn;

    async fn watch(&self, keys: &[String]) -> StoreResult<RedisTxn> {
        let mut conn = self.checkout().await?;
        self.call(redis::cmd("WATCH").arg(keys).query_async::<_, ()>(&mut conn))
            .await?;

        Ok(RedisTxn {
            conn,
            broken: false,
        })
    }

    async fn read(&self, txn: &mut RedisTxn, key: &str) -> StoreResult<Option<String>> {
        let result = self.call(txn.conn.get::<_, Option<String>>(key)).await;
        if result.is_err() {
            txn.broken = true;
        }
        result
    }

    async fn commit(&self, mut txn: RedisTxn, writes: Vec<Write>) -> StoreResult<bool> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for write in writes {
            match write {
                Write::Set {
                    key,
                    value,
                    ttl: Some(ttl),
                } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("EX")
                        .arg(ttl.as_secs().max(1))
                        .ignore();
                }
                Write::Set {
                    key,
                    value,
                    ttl: None,
                } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                Write::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }

        // EXEC replies nil when a watched key changed
        let executed: Option<()> = self.call(pipe.query_async(&mut txn.conn)).await?;
        self.checkin(txn.conn);

        Ok(executed.is_some())
    }

    async fn release(&self, mut txn: RedisTxn) {
        if txn.broken {
            return;
        }

        match self
            .call(redis::cmd("UNWATCH").query_async::<_, ()>(&mut txn.conn))
            .await
        {
            Ok(()) => self.checkin(txn.conn),
            Err(e) => warn!("Dropping Redis connection after failed UNWATCH: {}", e),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.shared.clone();
        self.call(conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.shared.clone();
        self.call(conn.set(key, value)).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.shared.clone();
        self.call(conn.set_nx(key, value)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.shared.clone();
        self.call(conn.del(key)).await
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.shared.clone();
        let pattern = pattern.to_string();

        self.call(async move {
            let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok::<_, redis::RedisError>(keys)
        })
        .await
    }
}

async fn bounded<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Unavailable(format!(
            "Redis call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

// Keep passwords out of logs
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}
