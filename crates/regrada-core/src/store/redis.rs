use super::{SharedStore, StoreError};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::{future::Future, time::Duration};
use tracing::info;

/// Redis-backed [`SharedStore`].
///
/// Uses a [`ConnectionManager`], which multiplexes one connection and reconnects on failure.
/// Every command is bounded by `operation_timeout` so a slow Redis cannot stall admission.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    operation_timeout: Duration,
}

impl RedisStore {
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the URL is invalid or the server is unreachable,
    /// or [`StoreError::Timeout`] if connecting takes longer than `operation_timeout`.
    pub async fn connect(url: &str, operation_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {e}")))?;

        let connection = tokio::time::timeout(operation_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(operation_timeout))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("connected to Redis");
        Ok(Self { connection, operation_timeout })
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.operation_timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.operation_timeout))?
            .map_err(StoreError::from)
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `SET key 0 PX ttl NX` then `INCR key` inside `MULTI`/`EXEC`.
///
/// The window key gets its expiry in the same transaction that creates it, and `INCR` keeps an
/// existing expiry, so a counter can never be left without one.
fn window_increment(key: &str, ttl: Duration) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(key)
        .arg(0)
        .arg("PX")
        .arg(millis(ttl))
        .arg("NX")
        .ignore()
        .incr(key, 1);
    pipe
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let pipe = window_increment(key, ttl);
        let (count,): (i64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.get(key)).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.bounded(conn.pset_ex(key, value, millis(ttl))).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
