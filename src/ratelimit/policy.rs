//! Rate limit policy: per-category, per-window quotas.
//!
//! The policy is loaded once at startup (from YAML or the built-in table) and
//! never mutated afterwards, so the engine reads it without locking.
//!
//! File format:
//!
//! ```yaml
//! categories:
//!   order:
//!     second: { limit: 100, cost: 25 }
//!     minute: { limit: 1000, cost: 250 }
//!   quote:
//!     second: { limit: 100, cost: 1 }
//!     minute: unlimited
//! ```
//!
//! A window that is missing, `null`, or `unlimited` has no quota.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use super::window::WindowKind;
use crate::error::{Result, TollgateError};

/// A request class, e.g. `order` or `quote`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    /// Create a category, normalizing the name to trimmed lowercase.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn order() -> Self {
        Self::new("order")
    }

    pub fn data() -> Self {
        Self::new("data")
    }

    pub fn quote() -> Self {
        Self::new("quote")
    }

    pub fn nontrading() -> Self {
        Self::new("nontrading")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Category {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        let category = Category::new(s);
        if category.0.is_empty() {
            return Err(TollgateError::UnknownCategory(s.to_string()));
        }
        Ok(category)
    }
}

/// Quota for one window: at most `limit` points, `cost` points per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowQuota {
    /// Maximum cumulative cost allowed within the window
    pub limit: u64,
    /// Points charged per granted request
    pub cost: u64,
}

impl WindowQuota {
    pub fn new(limit: u64, cost: u64) -> Self {
        Self { limit, cost }
    }

    /// Whether a request costing `cost` still fits when `count` points are used.
    pub fn admits(&self, count: u64) -> bool {
        count.saturating_add(self.cost) <= self.limit
    }

    /// Whole requests still affordable after `count` points are used.
    ///
    /// Negative when concurrent commits pushed the counter past the limit.
    pub fn remaining_requests(&self, count: u64) -> i64 {
        (self.limit as i64 - count as i64).div_euclid(self.cost.max(1) as i64)
    }
}

/// A window's quota, or no quota at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Option<QuotaRepr>", into = "QuotaRepr")]
pub enum Quota {
    Limited(WindowQuota),
    Unlimited,
}

impl Quota {
    pub fn limited(limit: u64, cost: u64) -> Self {
        Quota::Limited(WindowQuota::new(limit, cost))
    }

    pub fn as_limited(&self) -> Option<&WindowQuota> {
        match self {
            Quota::Limited(quota) => Some(quota),
            Quota::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Quota::Unlimited)
    }
}

/// On-disk representation: a `{limit, cost}` map or the `unlimited` keyword.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum QuotaRepr {
    Limited(WindowQuota),
    Keyword(String),
}

impl TryFrom<Option<QuotaRepr>> for Quota {
    type Error = String;

    fn try_from(repr: Option<QuotaRepr>) -> std::result::Result<Self, Self::Error> {
        match repr {
            None => Ok(Quota::Unlimited),
            Some(QuotaRepr::Keyword(word)) if word.eq_ignore_ascii_case("unlimited") => {
                Ok(Quota::Unlimited)
            }
            Some(QuotaRepr::Keyword(word)) => Err(format!(
                "expected {{limit, cost}} or \"unlimited\", found \"{}\"",
                word
            )),
            Some(QuotaRepr::Limited(quota)) if quota.cost == 0 => {
                Err("quota cost must be greater than zero".to_string())
            }
            Some(QuotaRepr::Limited(quota)) => Ok(Quota::Limited(quota)),
        }
    }
}

impl From<Quota> for QuotaRepr {
    fn from(quota: Quota) -> Self {
        match quota {
            Quota::Limited(q) => QuotaRepr::Limited(q),
            Quota::Unlimited => QuotaRepr::Keyword("unlimited".to_string()),
        }
    }
}

/// The quotas of a single category, one per window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CategoryPolicy {
    quotas: BTreeMap<WindowKind, Quota>,
}

impl CategoryPolicy {
    /// Build from a partial window table; missing windows are unlimited.
    pub fn new(quotas: impl IntoIterator<Item = (WindowKind, Quota)>) -> Self {
        let mut table: BTreeMap<WindowKind, Quota> = WindowKind::ALL
            .iter()
            .map(|w| (*w, Quota::Unlimited))
            .collect();
        table.extend(quotas);
        Self { quotas: table }
    }

    pub fn quota(&self, window: WindowKind) -> Quota {
        self.quotas.get(&window).copied().unwrap_or(Quota::Unlimited)
    }

    /// Windows carrying a quota, shortest first.
    pub fn limited_windows(&self) -> impl Iterator<Item = (WindowKind, WindowQuota)> + '_ {
        self.quotas
            .iter()
            .filter_map(|(w, q)| q.as_limited().map(|quota| (*w, *quota)))
    }

    /// Per-window cost of quota-bearing windows.
    pub fn costs(&self) -> BTreeMap<WindowKind, u64> {
        self.limited_windows().map(|(w, q)| (w, q.cost)).collect()
    }
}

/// Immutable mapping of category to window quotas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitPolicy {
    categories: BTreeMap<Category, CategoryPolicy>,
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    categories: BTreeMap<String, BTreeMap<WindowKind, Quota>>,
}

impl RateLimitPolicy {
    /// Create an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in policy for the order, data, quote and nontrading APIs.
    pub fn canonical() -> Self {
        use WindowKind::*;

        Self::new()
            .with_category(
                Category::order(),
                [
                    (Second, Quota::limited(100, 25)),
                    (Minute, Quota::limited(1000, 250)),
                    (Hour, Quota::limited(5000, 1000)),
                    (Day, Quota::limited(35000, 7000)),
                ],
            )
            .with_category(
                Category::data(),
                [
                    (Second, Quota::limited(100, 10)),
                    (Minute, Quota::limited(1000, 100)),
                    (Hour, Quota::limited(25000, 5000)),
                    (Day, Quota::limited(50000, 10000)),
                ],
            )
            .with_category(Category::quote(), [(Second, Quota::limited(100, 1))])
            .with_category(Category::nontrading(), [(Second, Quota::limited(100, 20))])
    }

    /// Add (or replace) a category. Windows not listed are unlimited.
    ///
    /// # Panics
    /// Panics if a quota has a zero cost; use [`try_with_category`] for
    /// quotas that are not known to be valid.
    ///
    /// [`try_with_category`]: RateLimitPolicy::try_with_category
    pub fn with_category(
        self,
        category: Category,
        quotas: impl IntoIterator<Item = (WindowKind, Quota)>,
    ) -> Self {
        match self.try_with_category(category, quotas) {
            Ok(policy) => policy,
            Err(err) => panic!("{}", err),
        }
    }

    /// Add (or replace) a category, rejecting quotas with a zero cost.
    pub fn try_with_category(
        mut self,
        category: Category,
        quotas: impl IntoIterator<Item = (WindowKind, Quota)>,
    ) -> Result<Self> {
        let policy = CategoryPolicy::new(quotas);
        for (window, quota) in policy.limited_windows() {
            if quota.cost == 0 {
                return Err(TollgateError::Config(format!(
                    "quota cost must be greater than zero ({} per {})",
                    category, window
                )));
            }
            if quota.cost > quota.limit {
                warn!(
                    category = %category,
                    window = %window,
                    cost = quota.cost,
                    limit = quota.limit,
                    "Quota cost exceeds its limit; every request in this window will be denied"
                );
            }
        }
        self.categories.insert(category, policy);
        Ok(self)
    }

    /// Load a policy from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Config(format!("Failed to parse rate limit policy: {}", e))
        })?;

        if file.categories.is_empty() {
            return Err(TollgateError::Config(
                "rate limit policy defines no categories".to_string(),
            ));
        }

        file.categories
            .into_iter()
            .try_fold(Self::new(), |policy, (name, quotas)| {
                policy.try_with_category(Category::new(name), quotas)
            })
    }

    /// Look up the quotas of a category.
    pub fn category(&self, category: &Category) -> Result<&CategoryPolicy> {
        self.categories
            .get(category)
            .ok_or_else(|| TollgateError::UnknownCategory(category.to_string()))
    }

    /// Quota of one window of a category.
    pub fn quota_for(&self, category: &Category, window: WindowKind) -> Result<Quota> {
        Ok(self.category(category)?.quota(window))
    }

    /// All configured categories.
    pub fn categories(&self) -> BTreeSet<Category> {
        self.categories.keys().cloned().collect()
    }

    /// Quota-bearing windows of a category, shortest first.
    pub fn windows_for(&self, category: &Category) -> Result<Vec<WindowKind>> {
        Ok(self
            .category(category)?
            .limited_windows()
            .map(|(window, _)| window)
            .collect())
    }

    /// Per-window cost table of a category.
    pub fn costs_for(&self, category: &Category) -> Result<BTreeMap<WindowKind, u64>> {
        Ok(self.category(category)?.costs())
    }
}
