//! Core rate limiter implementation.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::decision::{Decision, WindowRemaining};
use super::key::CounterKey;
use super::policy::{Category, CategoryPolicy, RateLimitPolicy, WindowQuota};
use super::window::WindowKind;
use crate::error::Result;
use crate::store::{CounterStore, StoreError, StoreResult};

/// One quota-bearing window of a request being evaluated.
struct Bucket {
    window: WindowKind,
    quota: WindowQuota,
    key: String,
}

/// The tiered rate limiter.
///
/// Built once at startup with the policy and the counter store, then shared
/// (usually behind an `Arc`) by every request path. It keeps no per-request
/// state in memory: all accounting lives in the store.
///
/// Each call reads every bucket first and only increments once all of them
/// have room. The read and the increment are separate round trips, so
/// concurrent calls for the same client and category can overshoot a limit by
/// at most `in-flight calls × cost` before the counters catch up.
pub struct RateLimiter<S, C = SystemClock> {
    policy: Arc<RateLimitPolicy>,
    store: Arc<S>,
    clock: C,
}

impl<S: CounterStore> RateLimiter<S, SystemClock> {
    /// Create a new rate limiter using the system clock.
    pub fn new(policy: Arc<RateLimitPolicy>, store: Arc<S>) -> Self {
        Self::with_clock(policy, store, SystemClock::new())
    }
}

impl<S: CounterStore, C: Clock> RateLimiter<S, C> {
    /// Create a new rate limiter with a custom clock.
    pub fn with_clock(policy: Arc<RateLimitPolicy>, store: Arc<S>, clock: C) -> Self {
        Self {
            policy,
            store,
            clock,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether `client_id` may make a `category` request, charging its
    /// cost to every window when it may.
    ///
    /// Fails only with `UnknownCategory`, before touching the store. Store
    /// failures produce an allowed decision with `remaining = -1` and the error
    /// attached.
    pub async fn check_and_consume(
        &self,
        client_id: &str,
        category: &Category,
    ) -> Result<Decision> {
        let category_policy = self.policy.category(category)?;

        trace!(
            client_id = %client_id,
            category = %category,
            "Checking rate limit"
        );

        match self.evaluate(client_id, category, category_policy).await {
            Ok(decision) => Ok(decision),
            Err(err) => {
                warn!(
                    client_id = %client_id,
                    category = %category,
                    error = %err,
                    "Counter store failed, admitting request without enforcement"
                );
                Ok(Decision::degraded(category.clone(), err.to_string()))
            }
        }
    }

    /// Current counter of one bucket, or `None` if it does not exist.
    pub async fn counter_value(
        &self,
        client_id: &str,
        category: &Category,
        window: WindowKind,
    ) -> Result<Option<u64>> {
        self.policy.category(category)?;
        let key = CounterKey::new(client_id, category, window).to_string_key();
        Ok(self.read_count(&key).await?)
    }

    async fn evaluate(
        &self,
        client_id: &str,
        category: &Category,
        policy: &CategoryPolicy,
    ) -> StoreResult<Decision> {
        let buckets: Vec<Bucket> = policy
            .limited_windows()
            .map(|(window, quota)| Bucket {
                window,
                quota,
                key: CounterKey::new(client_id, category, window).to_string_key(),
            })
            .collect();

        // Every window must have room before anything is charged.
        for bucket in &buckets {
            let count = self.current_count(bucket).await?;

            if !bucket.quota.admits(count) {
                let reset_time = bucket.window.reset_after(self.clock.now_secs());
                debug!(
                    key = %bucket.key,
                    count = count,
                    cost = bucket.quota.cost,
                    limit = bucket.quota.limit,
                    reset_time = reset_time,
                    "Rate limit exceeded"
                );
                return Ok(Decision::deny(
                    category.clone(),
                    bucket.window,
                    bucket.quota,
                    count,
                    reset_time,
                ));
            }
        }

        try_join_all(buckets.iter().map(|bucket| self.commit(bucket))).await?;

        let counts = try_join_all(buckets.iter().map(|bucket| self.read_count(&bucket.key))).await?;

        let mut remaining: BTreeMap<WindowKind, WindowRemaining> = WindowKind::ALL
            .iter()
            .map(|window| (*window, WindowRemaining::Unlimited))
            .collect();
        for (bucket, count) in buckets.iter().zip(counts) {
            let left = bucket.quota.remaining_requests(count.unwrap_or(0));
            remaining.insert(bucket.window, WindowRemaining::Count(left));
        }

        Ok(Decision::allow(category.clone(), remaining, policy.costs()))
    }

    /// Read a bucket, creating it with a fresh TTL when it does not exist.
    async fn current_count(&self, bucket: &Bucket) -> StoreResult<u64> {
        match self.read_count(&bucket.key).await? {
            Some(count) => Ok(count),
            None => {
                let created = self
                    .store
                    .set_if_absent(&bucket.key, 0, bucket.window.duration_secs())
                    .await?;
                trace!(key = %bucket.key, created = created, "Initialized bucket");
                Ok(0)
            }
        }
    }

    /// Charge one request to a bucket.
    async fn commit(&self, bucket: &Bucket) -> StoreResult<u64> {
        let count = self
            .store
            .increment_by(&bucket.key, bucket.quota.cost)
            .await?;

        // The bucket may have expired after the check; INCRBY then recreates
        // it without a TTL, which would never reset.
        if count == bucket.quota.cost {
            self.store
                .expire(&bucket.key, bucket.window.duration_secs())
                .await?;
        }

        Ok(count)
    }

    /// Read a counter, treating a corrupted value as zero.
    async fn read_count(&self, key: &str) -> StoreResult<Option<u64>> {
        match self.store.get(key).await {
            Err(StoreError::MalformedValue { key, value }) => {
                warn!(key = %key, value = %value, "Ignoring malformed counter value");
                Ok(Some(0))
            }
            other => other,
        }
    }
}

#[async_trait]
impl<S, C> RateLimiterBackend for RateLimiter<S, C>
where
    S: CounterStore + 'static,
    C: Clock + 'static,
{
    async fn check_and_consume(&self, client_id: &str, category: &Category) -> Result<Decision> {
        RateLimiter::check_and_consume(self, client_id, category).await
    }

    fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    async fn health(&self) -> StoreResult<()> {
        self.store.ping().await
    }
}
