//! Short-TTL response cache serving repeated read requests.
//!
//! The router records every `GetDataResponse` it routes, keyed by the
//! response's embedded data key. A later `GetData` for a fresh key is
//! answered from here without touching the key's actual holders.
//!
//! Bounded [`lru::LruCache`] with LRU-on-read: a cache hit refreshes the
//! entry's recency, capacity overflow evicts the least-recently-used
//! entry, and stale entries are evicted on lookup.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identity::Address;

struct CacheEntry {
    value: Vec<u8>,
    inserted_at: Instant,
}

pub struct ResponseCache {
    entries: LruCache<Address, CacheEntry>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity must be non-zero");
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Fresh value for `key`, refreshing its LRU position; stale entries
    /// are dropped and miss.
    pub fn get(&mut self, key: &Address) -> Option<Vec<u8>> {
        match self.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                self.entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh; over capacity the least-recently-used entry goes.
    pub fn put(&mut self, key: Address, value: Vec<u8>) {
        self.entries.put(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
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
