//! Shared key/value store holding rate-window counters and cached credentials.
//!
//! Counters must live outside the process so every server instance enforces the same limit.
//! [`RedisStore`](redis::RedisStore) is the production backend; [`MemoryStore`](memory::MemoryStore)
//! serves tests and single-node development.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increments `key` and returns the new value.
    ///
    /// When the increment creates the key (the result is 1) the key is set to expire after
    /// `ttl`. Later increments leave the expiry untouched.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for logs and health output.
    fn backend_name(&self) -> &'static str;
}
