//! Last-known-good results with age-based staleness.
//!
//! Entries are replaced wholesale on every successful fetch. Staleness is
//! derived from the entry's age at read time and never stored.

use crate::clock::{SharedClock, elapsed_since};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which an entry is reported stale.
    #[serde(rename = "staleness_threshold_ms", with = "crate::config::duration_ms")]
    pub staleness_threshold: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// A stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,
    /// Stored value.
    pub data: serde_json::Value,
    /// When the value was stored.
    pub timestamp: DateTime<Utc>,
}

/// A typed cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    /// Cached value.
    pub data: T,
    /// When the value was stored.
    pub timestamp: DateTime<Utc>,
    /// Whether the value is older than the staleness threshold.
    pub is_stale: bool,
}

/// In-memory cache of remote results.
#[derive(Debug)]
pub struct CacheStore {
    config: CacheConfig,
    clock: SharedClock,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Create an empty cache.
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the configured staleness threshold.
    pub fn staleness_threshold(&self) -> Duration {
        self.config.staleness_threshold
    }

    /// Get the raw entry for `key`.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Get the value for `key`, decoded as `T`.
    ///
    /// An entry that does not decode as `T` is treated as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
        let entry = self.get_entry(key)?;
        let is_stale = self.entry_is_stale(&entry);

        match serde_json::from_value(entry.data) {
            Ok(data) => Some(Cached {
                data,
                timestamp: entry.timestamp,
                is_stale,
            }),
            Err(e) => {
                warn!(key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// A value that cannot be serialized is logged and skipped.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize value for cache");
                return;
            }
        };

        let entry = CacheEntry {
            key: key.to_string(),
            data,
            timestamp: self.clock.now(),
        };
        self.entries.write().insert(key.to_string(), entry);
        debug!(key, "Cache entry stored");
    }

    /// Whether the entry for `key` is stale. Missing entries are not stale.
    pub fn is_stale(&self, key: &str) -> bool {
        self.entries
            .read()
            .get(key)
            .map(|entry| self.entry_is_stale(entry))
            .unwrap_or(false)
    }

    fn entry_is_stale(&self, entry: &CacheEntry) -> bool {
        elapsed_since(self.clock.as_ref(), entry.timestamp) > self.config.staleness_threshold
    }

    /// Remove the entry for `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn clear_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(prefix, removed, "Cache entries invalidated");
        }
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn cache() -> (CacheStore, ManualClock) {
        let clock = ManualClock::new();
        (CacheStore::new(CacheConfig::default(), clock.shared()), clock)
    }

    #[test]
    fn test_staleness_boundary() {
        let (cache, clock) = cache();
        cache.set("patient:1", &json!({"name": "Ada"}));

        clock.advance(Duration::from_millis(1));
        let fresh = cache.get::<serde_json::Value>("patient:1").unwrap();
        assert!(!fresh.is_stale);

        clock.advance(Duration::from_secs(5 * 60));
        let stale = cache.get::<serde_json::Value>("patient:1").unwrap();
        assert!(stale.is_stale);
        assert!(cache.is_stale("patient:1"));
    }

    #[test]
    fn test_set_replaces_wholesale() {
        let (cache, clock) = cache();
        cache.set("patient:1", &json!({"name": "Ada", "age": 36}));
        clock.advance(Duration::from_secs(600));
        cache.set("patient:1", &json!({"name": "Ada L."}));

        let hit = cache.get::<serde_json::Value>("patient:1").unwrap();
        assert_eq!(hit.data, json!({"name": "Ada L."}));
        assert!(!hit.is_stale);
    }

    #[test]
    fn test_typed_get() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Patient {
            id: u32,
            name: String,
        }

        let (cache, _clock) = cache();
        let ada = Patient {
            id: 1,
            name: "Ada".into(),
        };
        cache.set("patient:1", &ada);

        assert_eq!(cache.get::<Patient>("patient:1").unwrap().data, ada);
        assert!(cache.get::<Vec<u8>>("patient:1").is_none());
        assert!(cache.get::<Patient>("patient:2").is_none());
    }

    #[test]
    fn test_clear_prefix() {
        let (cache, _clock) = cache();
        cache.set("patient:1", &1);
        cache.set("patient:search:ada", &2);
        cache.set("resource:Observation:9", &3);

        assert_eq!(cache.clear_prefix("patient:"), 2);
        assert_eq!(cache.keys(), vec!["resource:Observation:9"]);
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }
}
