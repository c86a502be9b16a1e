//! Wall-clock sources for reset-time estimates and in-memory TTLs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of the current Unix time in whole seconds.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// System clock backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// Manually driven clock.
///
/// Clones share the same time, so a test can hold one clone and advance it
/// while the limiter and store read from the others.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now_secs: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now_secs)),
        }
    }

    pub fn set(&self, now_secs: u64) {
        self.now.store(now_secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_secs(&self) -> u64 {
        (**self).now_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_recent() {
        // 2024-01-01T00:00:00Z
        assert!(SystemClock::new().now_secs() > 1_704_067_200);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();

        clock.advance(59);
        assert_eq!(other.now_secs(), 1_059);

        other.set(5);
        assert_eq!(clock.now_secs(), 5);
    }
}
