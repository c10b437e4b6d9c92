//! LRU hot-key cache driving eviction from the primary tier

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Recency order over keys resident in the primary tier
///
/// The cache itself stores no values: it only remembers which keys were
/// touched most recently so the least-recent ones can be chosen as eviction
/// victims once the primary tier grows past its capacity.
pub struct EvictionCache<K: Hash + Eq> {
    cache: Mutex<LruCache<K, ()>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl<K: Hash + Eq + Copy> EvictionCache<K> {
    /// Create an empty cache; the capacity is enforced by the caller
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::unbounded()),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    /// Mark a batch of keys as most recently used
    pub fn update(&self, keys: &[K]) {
        let mut cache = self.cache.lock();
        let mut hits = 0;
        for &key in keys {
            if cache.put(key, ()).is_some() {
                hits += 1;
            }
        }
        self.hit_count.fetch_add(hits, Ordering::Relaxed);
        self.miss_count
            .fetch_add(keys.len() as u64 - hits, Ordering::Relaxed);
    }

    /// Pop up to `count` least-recently-used keys
    pub fn evict(&self, count: usize) -> Vec<K> {
        let mut cache = self.cache.lock();
        let mut victims = Vec::with_capacity(count.min(cache.len()));
        while victims.len() < count {
            match cache.pop_lru() {
                Some((key, ())) => victims.push(key),
                None => break,
            }
        }
        victims
    }

    /// Pop least-recently-used keys until at most `capacity` remain
    pub fn evict_over(&self, capacity: usize) -> Vec<K> {
        let excess = self.len().saturating_sub(capacity);
        if excess == 0 {
            return Vec::new();
        }
        self.evict(excess)
    }

    /// Remove from cache
    pub fn remove(&self, key: &K) {
        self.cache.lock().pop(key);
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            hit_rate,
            size: self.len(),
        }
    }
}

impl<K: Hash + Eq + Copy> Default for EvictionCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
}
