//! Rate limiter trait for abstracting over store and clock types.

use async_trait::async_trait;

use super::decision::Decision;
use super::policy::{Category, RateLimitPolicy};
use crate::error::Result;
use crate::store::StoreResult;

/// Trait for rate limiter implementations.
///
/// This trait erases the store and clock type parameters of `RateLimiter`
/// so the HTTP layer can hold any limiter as `Arc<dyn RateLimiterBackend>`.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Check the quota of `category` for `client_id` and charge it if admitted.
    async fn check_and_consume(&self, client_id: &str, category: &Category) -> Result<Decision>;

    /// The policy the limiter enforces.
    fn policy(&self) -> &RateLimitPolicy;

    /// Round trip to the underlying counter store.
    async fn health(&self) -> StoreResult<()>;
}
