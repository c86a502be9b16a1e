//! Admission decisions returned by the rate limiter.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use super::policy::{Category, WindowQuota};
use super::window::WindowKind;

/// Remaining budget of one window, in whole requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRemaining {
    Count(i64),
    Unlimited,
}

impl Serialize for WindowRemaining {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WindowRemaining::Count(n) => serializer.serialize_i64(*n),
            WindowRemaining::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// Remaining budget attached to a decision.
///
/// Allowed requests carry a per-window map. Denied requests report `0` and
/// degraded (fail-open) requests report `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Remaining {
    Windows(BTreeMap<WindowKind, WindowRemaining>),
    Scalar(i64),
}

/// Outcome of a single `check_and_consume` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub category: Category,
    /// Window that triggered a denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_request: Option<u64>,
    pub remaining: Remaining,
    /// Per-window cost table of the category (allowed requests only)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub costs: BTreeMap<WindowKind, u64>,
    /// Seconds until the denying window is estimated to reset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Store failure that caused a fail-open decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Decision {
    /// An admitted request.
    pub fn allow(
        category: Category,
        remaining: BTreeMap<WindowKind, WindowRemaining>,
        costs: BTreeMap<WindowKind, u64>,
    ) -> Self {
        Self {
            allowed: true,
            category,
            window: None,
            cost_per_request: None,
            remaining: Remaining::Windows(remaining),
            costs,
            reset_time: None,
            message: None,
            error: None,
        }
    }

    /// A request rejected because `window` has no room for its cost.
    pub fn deny(
        category: Category,
        window: WindowKind,
        quota: WindowQuota,
        used: u64,
        reset_time: u64,
    ) -> Self {
        let message = format!(
            "Rate limit exceeded for {window}. Each {category} request costs {cost} points, \
             and you have used {used} out of {limit} points this {window}.",
            window = window,
            category = category,
            cost = quota.cost,
            used = used,
            limit = quota.limit,
        );

        Self {
            allowed: false,
            category,
            window: Some(window),
            cost_per_request: Some(quota.cost),
            remaining: Remaining::Scalar(0),
            costs: BTreeMap::new(),
            reset_time: Some(reset_time),
            message: Some(message),
            error: None,
        }
    }

    /// A request admitted without enforcement because the store failed.
    pub fn degraded(category: Category, error: impl Into<String>) -> Self {
        Self {
            allowed: true,
            category,
            window: None,
            cost_per_request: None,
            remaining: Remaining::Scalar(-1),
            costs: BTreeMap::new(),
            reset_time: None,
            message: None,
            error: Some(error.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// Remaining budget of one window, when the decision carries a per-window map.
    pub fn remaining_for(&self, window: WindowKind) -> Option<WindowRemaining> {
        match &self.remaining {
            Remaining::Windows(map) => map.get(&window).copied(),
            Remaining::Scalar(_) => None,
        }
    }
}
