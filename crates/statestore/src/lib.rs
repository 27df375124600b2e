//! Client for the shared key-value state store.
//!
//! Tunnel and token records live in an external store so the control plane
//! can crash and recover without leaking public endpoints. The store contract
//! is deliberately small: plain get/set/delete, set-if-absent for allocation,
//! compare-and-swap for single-use consumption and status transitions, key
//! TTLs, an atomic counter, and a prefix scan for startup reconciliation.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by state store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something we could not interpret
    #[error("state store protocol error: {0}")]
    Protocol(String),

    /// An individual round-trip exceeded the configured timeout
    #[error("state store operation timed out")]
    Timeout,

    /// The configured store URL is not usable
    #[error("invalid state store url: {0}")]
    InvalidUrl(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Timeout
    }
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// The key-value primitives the lifecycle engine relies on.
///
/// Values are UTF-8 strings (JSON documents in practice). Every mutation the
/// engine performs concurrently goes through `set_if_absent` or
/// `compare_and_swap`; plain `set` is reserved for keys the caller owns
/// exclusively at that point in the lifecycle.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Round-trip liveness check.
    async fn ping(&self) -> Result<()>;

    /// Fetch a value, `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally write a value, with an optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key does not exist. Returns whether the write won.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Replace the value only if it currently equals `expected`, preserving
    /// any TTL on the key. Returns whether the swap happened.
    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically add `delta` to an integer key, returning the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// All keys beginning with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Human-readable memory figure from the store, when it reports one.
    async fn memory_usage(&self) -> Result<Option<String>>;
}

/// Build a store client from a `STATE_STORE_URL` value.
///
/// `redis://` and `rediss://` endpoints get the wire client; `memory://`
/// yields the in-process store (tests and single-node development).
pub fn connect(store_url: &str) -> Result<Arc<dyn StateStore>> {
    if store_url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(RedisStore::new(store_url)?))
}
