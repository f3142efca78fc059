use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Default number of results kept by [`ResultCache`]
pub const DEFAULT_CACHE_CAPACITY: usize = 10;
/// Default lifetime of a cached result
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded map of query results with a fixed time-to-live.
///
/// Eviction is oldest-inserted first. Reads only `peek`, so they never
/// promote an entry, and replacing a key keeps its original position. The
/// LRU order therefore is the insertion order. Callers pass `now`
/// explicitly. A capacity of zero is treated as one.
pub struct ResultCache<V> {
    ttl: Duration,
    entries: LruCache<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) < self.ttl
    }

    /// Look up `key`. An entry older than the TTL is a miss and is removed.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let fresh = self.entries.peek(key).map(|entry| self.is_fresh(entry, now));
        match fresh {
            Some(true) => {
                self.hits += 1;
                self.entries.peek(key).map(|entry| entry.value.clone())
            }
            Some(false) => {
                self.entries.pop(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert `key`, evicting the oldest entry when full. Replacing an
    /// existing key updates it in place.
    pub fn insert(&mut self, key: String, value: V, now: Instant) {
        let entry = CacheEntry {
            value,
            inserted_at: now,
        };
        if let Some(existing) = self.entries.peek_mut(&key) {
            *existing = entry;
            return;
        }
        self.entries.push(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.pop(key).map(|entry| entry.value)
    }

    /// Drop entries whose TTL has passed. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !self.is_fresh(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}
