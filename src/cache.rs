//! Bounded map with LRU recency and batch eviction: past capacity, the
//! least-recently-used fifth is dropped at once before the insert. Overflow
//! is a normal event, handled the same way for every cache that uses this.

use std::hash::Hash;

use lru::LruCache;

/// Fraction of the capacity evicted per overflow.
const EVICT_FRACTION: usize = 5;

pub struct LruBatchCache<K: Hash + Eq, V> {
    cap: usize,
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq, V> LruBatchCache<K, V> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            // The batch policy below enforces the bound, not the LruCache.
            inner: LruCache::unbounded(),
        }
    }

    /// Insert or replace an entry. When a new key would exceed the capacity,
    /// the oldest fifth of entries is evicted first. Returns the number of
    /// evicted entries.
    pub fn put(&mut self, key: K, value: V) -> usize {
        let mut evicted = 0;
        if !self.inner.contains(&key) && self.inner.len() >= self.cap {
            let batch = (self.cap / EVICT_FRACTION).max(1);
            for _ in 0..batch {
                if self.inner.pop_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
        }
        self.inner.put(key, value);
        evicted
    }

    /// Look up an entry, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Presence check; does not touch recency.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn pop(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
