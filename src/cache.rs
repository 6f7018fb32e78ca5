//! Client-local response cache with etag revalidation.
//!
//! Entries are evicted by LRU capacity or by age, whichever comes first.
//! Disconnects do not clear the cache: stale entries are revalidated through
//! their etag on the next cached read.

use crate::config::CacheConfig;
use bridge_protocol::Command;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// A cached value and the etag the peer attached to it
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub etag: String,
    pub data: Value,
}

struct Stored {
    entry: CacheEntry,
    inserted: Instant,
}

pub struct ResponseCache {
    entries: LruCache<String, Stored>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Build from config; `None` when caching is disabled
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.capacity, config.ttl))
    }

    /// Look up an entry, promoting it; expired entries are dropped
    pub fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let expired = match self.entries.get(key) {
            Some(stored) => stored.inserted.elapsed() > self.ttl,
            None => return None,
        };

        if expired {
            log::debug!("Cache entry expired: {}", key);
            self.entries.pop(key);
            return None;
        }

        self.entries.get(key).map(|stored| stored.entry.clone())
    }

    pub fn set(&mut self, key: String, entry: CacheEntry) {
        self.entries.put(
            key,
            Stored {
                entry,
                inserted: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache key: `namespace/instance/(prop | serialized args)`
    pub fn build_key(command: &Command) -> String {
        let instance = command.instance_id.as_deref().unwrap_or("");
        let detail = match command.prop_name() {
            Some(prop) => prop.to_string(),
            None => command
                .args
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_default(),
        };
        format!("{}/{}/{}", command.namespace, instance, detail)
    }
}
