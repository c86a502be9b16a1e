//! Counter store abstraction.
//!
//! The rate limiter keeps every bucket in a shared key-value store with atomic
//! increments and per-key expiry. No multi-key transactions are assumed: each
//! counter is an independent, independently expiring value.

mod memory;
mod redis_store;

pub use self::memory::MemoryCounterStore;
pub use self::redis_store::{RedisCounterStore, RedisStoreSettings};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by counter store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or rejected the command
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time
    #[error("counter store {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// A stored value is not a non-negative integer
    #[error("malformed counter value at {key}: {value:?}")]
    MalformedValue { key: String, value: String },
}

impl StoreError {
    /// Connectivity problems that may clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout { .. })
    }
}

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the rate limiter needs from a shared counter store.
///
/// Every method is a potential suspension point; implementations must be safe
/// to call concurrently from many tasks.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value of `key`, or `None` if it does not exist (or has expired).
    async fn get(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Create `key` with `value` and a TTL, unless it already exists.
    ///
    /// Returns `true` if the key was created.
    async fn set_if_absent(&self, key: &str, value: u64, ttl_secs: u64) -> StoreResult<bool>;

    /// Atomically add `delta` to `key` and return the new value.
    ///
    /// A missing key is created from zero, without a TTL.
    async fn increment_by(&self, key: &str, delta: u64) -> StoreResult<u64>;

    /// Set or refresh the TTL of an existing key.
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()>;

    /// Round trip to the store, for health checks.
    async fn ping(&self) -> StoreResult<()>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<u64>> {
        (**self).get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: u64, ttl_secs: u64) -> StoreResult<bool> {
        (**self).set_if_absent(key, value, ttl_secs).await
    }

    async fn increment_by(&self, key: &str, delta: u64) -> StoreResult<u64> {
        (**self).increment_by(key, delta).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        (**self).expire(key, ttl_secs).await
    }

    async fn ping(&self) -> StoreResult<()> {
        (**self).ping().await
    }
}

/// Parse a raw stored value as a counter.
pub(crate) fn parse_counter(key: &str, raw: &str) -> StoreResult<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| StoreError::MalformedValue {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter("k", "42"), Ok(42));
        assert_eq!(parse_counter("k", " 7 "), Ok(7));
        assert!(matches!(
            parse_counter("k", "-3"),
            Err(StoreError::MalformedValue { .. })
        ));
        assert!(matches!(
            parse_counter("k", "abc"),
            Err(StoreError::MalformedValue { .. })
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("refused".into()).is_transient());
        assert!(StoreError::Timeout {
            op: "GET",
            after: Duration::from_millis(5)
        }
        .is_transient());
        assert!(!StoreError::MalformedValue {
            key: "k".into(),
            value: "x".into()
        }
        .is_transient());
    }
}
