//! Counter key generation and handling.

use std::fmt;

use super::policy::Category;
use super::window::WindowKind;

/// Namespace shared by every counter key in the store.
const KEY_NAMESPACE: &str = "ratelimit";

/// A key that uniquely identifies one bucket in the counter store.
///
/// The string form is `ratelimit:{client_id}:{category}:{window}`. It carries
/// no window-start timestamp: a bucket lives until its TTL expires, and the
/// next request after that lazily creates a fresh one under the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The client identity (usually the remote address)
    pub client_id: String,
    /// The request category
    pub category: Category,
    /// The accounting window
    pub window: WindowKind,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(client_id: &str, category: &Category, window: WindowKind) -> Self {
        Self {
            client_id: client_id.to_string(),
            category: category.clone(),
            window,
        }
    }

    /// Convert the counter key to its store representation.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            KEY_NAMESPACE, self.client_id, self.category, self.window
        )
    }

    /// Parse a store key back into its parts.
    ///
    /// Splits from the right so client ids containing `:` (IPv6) survive.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(KEY_NAMESPACE)?.strip_prefix(':')?;

        let (rest, window) = rest.rsplit_once(':')?;
        let window: WindowKind = window.parse().ok()?;

        let (client_id, category) = rest.rsplit_once(':')?;
        if client_id.is_empty() || category.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            category: Category::new(category),
            window,
        })
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_to_string() {
        let key = CounterKey::new("10.0.0.7", &Category::order(), WindowKind::Minute);
        assert_eq!(key.to_string_key(), "ratelimit:10.0.0.7:order:minute");
        assert_eq!(key.to_string(), key.to_string_key());
    }

    #[test]
    fn test_counter_key_parse_ipv6() {
        let key = CounterKey::new("::ffff:10.0.0.7", &Category::quote(), WindowKind::Second);
        let parsed = CounterKey::parse(&key.to_string_key()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_counter_key_parse_invalid() {
        assert!(CounterKey::parse("invalid").is_none());
        assert!(CounterKey::parse("ratelimit:client:order").is_none());
        assert!(CounterKey::parse("ratelimit:client:order:week").is_none());
        assert!(CounterKey::parse("other:client:order:second").is_none());
    }

    #[test]
    fn test_counter_key_unique_per_tuple() {
        let a = CounterKey::new("c1", &Category::data(), WindowKind::Hour);
        let b = CounterKey::new("c1", &Category::data(), WindowKind::Day);
        let c = CounterKey::new("c2", &Category::data(), WindowKind::Hour);
        assert_ne!(a.to_string_key(), b.to_string_key());
        assert_ne!(a.to_string_key(), c.to_string_key());
    }
}
