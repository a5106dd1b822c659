//! Pluggable key/value cache consulted by the DNS facade.
//!
//! Keys are ASCII strings; values are JSON-like ([`serde_json::Value`]):
//! strings, lists of strings, the literal `false`, or a two-element list.
//! Implementations must tolerate concurrent `has`/`get`/`set` when shared,
//! and `set` failures must be silent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Collaborator contract for the cache.
pub trait Cache: Send + Sync {
    /// Returns true if `key` holds a live entry.
    fn has(&self, key: &str) -> bool;

    /// Returns the live value for `key`, if any.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`, optionally expiring after `ttl`.
    fn set(&self, key: &str, value: Value, ttl: Option<Duration>);
}

/// Process-local cache with per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Value, Option<Instant>)>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: &(Value, Option<Instant>)) -> bool {
        entry.1.map_or(true, |deadline| Instant::now() < deadline)
    }
}

impl Cache for MemoryCache {
    fn has(&self, key: &str) -> bool {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        entries.get(key).is_some_and(Self::live)
    }

    fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|entry| Self::live(entry))
            .map(|(value, _)| value.clone())
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if let Ok(mut entries) = self.entries.lock() {
            let deadline = ttl.map(|ttl| Instant::now() + ttl);
            entries.insert(key.to_string(), (value, deadline));
        }
    }
}

/// Cache that stores nothing; every lookup misses.
#[derive(Debug, Default)]
pub struct NullCache;

impl Cache for NullCache {
    fn has(&self, _key: &str) -> bool {
        false
    }

    fn get(&self, _key: &str) -> Option<Value> {
        None
    }

    fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) {}
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let cache = MemoryCache::new();
        cache.set("domain:example.com.", json!(["mx.example.com"]), None);
        assert!(cache.has("domain:example.com."));
        assert_eq!(
            cache.get("domain:example.com."),
            Some(json!(["mx.example.com"]))
        );
        assert!(!cache.has("domain:other.example."));
    }

    #[test]
    fn false_is_a_storable_value() {
        let cache = MemoryCache::new();
        cache.set("rbl:1.0.0.127", json!(false), None);
        assert!(cache.has("rbl:1.0.0.127"));
        assert_eq!(cache.get("rbl:1.0.0.127"), Some(json!(false)));
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = MemoryCache::new();
        cache.set("k", json!("v"), Some(Duration::ZERO));
        assert!(!cache.has("k"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let cache = MemoryCache::new();
        cache.set("k", json!([]), None);
        cache.set("k", json!(["a"]), None);
        assert_eq!(cache.get("k"), Some(json!(["a"])));
    }

    #[test]
    fn null_cache_never_hits() {
        let cache = NullCache;
        cache.set("k", json!("v"), None);
        assert!(!cache.has("k"));
    }
}
