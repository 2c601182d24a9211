//! Expiring key/value cache.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at_epoch_ms: i64,
}

/// Process-local TTL cache. Expired entries are evicted lazily on lookup.
#[derive(Debug)]
pub struct TtlCache<T> {
    entries: DashMap<String, CacheEntry<T>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let now_ms = now.timestamp_millis();
        let hit = self
            .entries
            .get(key)
            .map(|entry| (entry.expires_at_epoch_ms > now_ms).then(|| entry.value.clone()));

        match hit {
            Some(Some(value)) => Some(value),
            Some(None) => {
                self.entries
                    .remove_if(key, |_, entry| entry.expires_at_epoch_ms <= now_ms);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) {
        self.set_at(key, value, ttl, Utc::now())
    }

    pub fn set_at(&self, key: impl Into<String>, value: T, ttl: Duration, now: DateTime<Utc>) {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at_epoch_ms: now.timestamp_millis().saturating_add(ttl_ms),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
