//! Accounting windows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Time window over which a quota applies.
///
/// Variants are declared shortest first, so the derived `Ord` sorts by duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Per-second window
    Second,
    /// Per-minute window
    Minute,
    /// Per-hour window
    Hour,
    /// Per-day window
    Day,
}

impl WindowKind {
    /// All windows, shortest first.
    pub const ALL: [WindowKind; 4] = [
        WindowKind::Second,
        WindowKind::Minute,
        WindowKind::Hour,
        WindowKind::Day,
    ];

    /// Length of this window in seconds.
    pub fn duration_secs(&self) -> u64 {
        match self {
            WindowKind::Second => 1,
            WindowKind::Minute => 60,
            WindowKind::Hour => 3600,
            WindowKind::Day => 86400,
        }
    }

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs())
    }

    /// Lowercase name, as used in counter keys and response metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Second => "second",
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
        }
    }

    /// Start of the wall-clock aligned window containing `now_secs`.
    pub fn window_start(&self, now_secs: u64) -> u64 {
        now_secs - (now_secs % self.duration_secs())
    }

    /// Seconds until the wall-clock aligned window containing `now_secs` ends.
    ///
    /// This is an estimate for callers. Buckets actually clear when their TTL
    /// elapses in the counter store, which is not aligned to the wall clock.
    pub fn reset_after(&self, now_secs: u64) -> u64 {
        self.window_start(now_secs) + self.duration_secs() - now_secs
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(WindowKind::Second),
            "minute" => Ok(WindowKind::Minute),
            "hour" => Ok(WindowKind::Hour),
            "day" => Ok(WindowKind::Day),
            other => Err(format!("unknown window: {}", other)),
        }
    }
}
