//! In-process counter store.
//!
//! Mirrors the Redis semantics the limiter relies on (string values, lazy
//! TTL expiry, `INCRBY` creating keys without a TTL) so it can stand in for
//! Redis in single-instance deployments and in tests.
//!
//! Expired keys are dropped when touched. Keys that are never touched again
//! are swept out by the next insert once `sweep_interval` has passed since
//! the previous sweep, so the map stays bounded by the live key set.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{parse_counter, CounterStore, StoreResult};
use crate::ratelimit::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Unix second at which the key disappears
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Seconds between sweeps of expired keys.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Counter store held in a concurrent map.
pub struct MemoryCounterStore<C: Clock = SystemClock> {
    entries: DashMap<String, Entry>,
    clock: Arc<C>,
    sweep_interval_secs: u64,
    /// Clock second of the last sweep
    last_sweep: AtomicU64,
}

impl MemoryCounterStore<SystemClock> {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }
}

impl Default for MemoryCounterStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryCounterStore<C> {
    /// Create a store driven by a custom clock.
    pub fn with_clock(clock: Arc<C>) -> Self {
        let now = clock.now_secs();
        Self {
            entries: DashMap::new(),
            clock,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            last_sweep: AtomicU64::new(now),
        }
    }

    /// Set how often inserts sweep expired keys.
    pub fn with_sweep_interval(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    /// Store a raw value with no TTL, bypassing counter semantics.
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Seconds left before `key` expires; `None` if it is missing or has no TTL.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_secs();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_secs();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored keys, expired ones included.
    pub fn stored_entries(&self) -> usize {
        self.entries.len()
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Purge if the sweep interval has elapsed. Only one caller wins the race.
    fn maybe_sweep(&self, now: u64) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now < last.saturating_add(self.sweep_interval_secs) {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let removed = self.purge_expired();
            debug!(removed = removed, "Swept expired counters");
        }
    }

    /// Remove `key` if its TTL has elapsed.
    fn evict_if_expired(&self, key: &str, now: u64) {
        self.entries.remove_if(key, |_, e| e.is_expired(now));
    }
}

#[async_trait]
impl<C: Clock + 'static> CounterStore for MemoryCounterStore<C> {
    async fn get(&self, key: &str) -> StoreResult<Option<u64>> {
        let now = self.clock.now_secs();
        self.evict_if_expired(key, now);

        match self.entries.get(key) {
            Some(entry) => parse_counter(key, &entry.value).map(Some),
            None => Ok(None),
        }
    }

    async fn set_if_absent(&self, key: &str, value: u64, ttl_secs: u64) -> StoreResult<bool> {
        let now = self.clock.now_secs();
        self.evict_if_expired(key, now);
        self.maybe_sweep(now);

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl_secs),
                });
                Ok(true)
            }
        }
    }

    async fn increment_by(&self, key: &str, delta: u64) -> StoreResult<u64> {
        let now = self.clock.now_secs();
        self.evict_if_expired(key, now);
        self.maybe_sweep(now);

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current = parse_counter(key, &entry.value)?;
        let next = current.saturating_add(delta);
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        let now = self.clock.now_secs();
        self.evict_if_expired(key, now);

        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(now + ttl_secs);
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
