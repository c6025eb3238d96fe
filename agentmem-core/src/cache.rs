//! Bounded LRU cache with per-entry TTL and prefix invalidation.
//!
//! Backs the read path of the backend adapter and the hot entries of every
//! store. Expired entries are evicted lazily on access and eagerly when an
//! insertion would overflow the size ceiling.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

use crate::clock::{Clock as _, SharedClock};

/// Cache effectiveness counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Lookups that returned a live entry
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries dropped by LRU pressure
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Entries dropped by explicit invalidation
    pub invalidations: u64,
    /// Current number of live entries
    pub size: usize,
    /// Configured entry ceiling
    pub capacity: usize,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Duration,
}

struct CacheState<V> {
    entries: LruCache<String, Entry<V>>,
    metrics: CacheMetrics,
}

/// Thread-safe bounded TTL cache.
///
/// Guarantees:
/// - `get` never returns a value older than the configured TTL
/// - after `invalidate`/`invalidate_prefix`, matching keys miss until re-inserted
/// - at most `capacity` entries are live at any instant
pub struct BoundedTtlCache<V> {
    state: Mutex<CacheState<V>>,
    ttl: Duration,
    capacity: usize,
    clock: SharedClock,
}

impl<V: Clone> BoundedTtlCache<V> {
    /// Create a cache with the given entry ceiling and TTL.
    ///
    /// A zero capacity is clamped to one entry.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration, clock: SharedClock) -> Self {
        let capacity = capacity.max(1);
        let entries = LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN));
        Self {
            state: Mutex::new(CacheState {
                entries,
                metrics: CacheMetrics {
                    capacity,
                    ..CacheMetrics::default()
                },
            }),
            ttl,
            capacity,
            clock,
        }
    }

    /// Look up a key, refreshing its LRU position on hit.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.monotonic();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.metrics.misses += 1;
                state.metrics.size = state.entries.len();
                return None;
            }
            Some(entry) => now.saturating_sub(entry.inserted_at) >= self.ttl,
        };

        if expired {
            state.entries.pop(key);
            state.metrics.expirations += 1;
            state.metrics.misses += 1;
            state.metrics.size = state.entries.len();
            return None;
        }

        state.metrics.hits += 1;
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or replace an entry.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let now = self.clock.monotonic();
        let mut state = self.state.lock();

        // Purge expired entries first so TTL victims go before live LRU ones.
        if state.entries.len() >= self.capacity {
            let ttl = self.ttl;
            let expired_keys: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| now.saturating_sub(entry.inserted_at) >= ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired_keys {
                state.entries.pop(&k);
                state.metrics.expirations += 1;
            }
        }

        let key = key.into();
        let was_present = state.entries.contains(&key);
        let at_capacity = state.entries.len() >= self.capacity;
        state.entries.put(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
        if !was_present && at_capacity {
            state.metrics.evictions += 1;
        }
        state.metrics.size = state.entries.len();
    }

    /// Drop one key. No-op when absent.
    pub fn invalidate(&self, key: &str) {
        let mut state = self.state.lock();
        if state.entries.pop(key).is_some() {
            state.metrics.invalidations += 1;
        }
        state.metrics.size = state.entries.len();
    }

    /// Drop every key with the given prefix before returning.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut state = self.state.lock();
        let matching: Vec<String> = state
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in matching {
            state.entries.pop(&key);
            state.metrics.invalidations += 1;
        }
        state.metrics.size = state.entries.len();
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let count = state.entries.len() as u64;
        state.entries.clear();
        state.metrics.invalidations += count;
        state.metrics.size = 0;
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.state.lock().metrics.clone()
    }

    /// Number of physically present entries (may include not-yet-reaped
    /// expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn cache_with_clock(capacity: usize, ttl_secs: u64) -> (BoundedTtlCache<String>, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let cache = BoundedTtlCache::new(capacity, Duration::from_secs(ttl_secs), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_get_put_round_trip() {
        let (cache, _clock) = cache_with_clock(10, 60);
        cache.put("k1", "v1".to_string());
        assert_eq!(cache.get("k1"), Some("v1".to_string()));
        assert_eq!(cache.get("k2"), None);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    #[test]
    fn test_ttl_expiry_on_access() {
        let (cache, clock) = cache_with_clock(10, 60);
        cache.put("k1", "v1".to_string());

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get("k1"), Some("v1".to_string()));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("k1"), None);
        assert_eq!(cache.metrics().expirations, 1);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let (cache, _clock) = cache_with_clock(3, 600);
        cache.put("a", "1".to_string());
        cache.put("b", "2".to_string());
        cache.put("c", "3".to_string());

        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get("a").is_some());
        cache.put("d", "4".to_string());

        assert!(cache.get("a").is_some());
        assert_eq!(cache.get("b"), None);
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.metrics().evictions, 1);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_expired_entries_purged_before_lru_eviction() {
        let (cache, clock) = cache_with_clock(2, 10);
        cache.put("old", "1".to_string());
        clock.advance(Duration::from_secs(11));
        cache.put("live", "2".to_string());

        // "old" is expired; inserting a third entry should reap it instead of
        // evicting "live".
        cache.put("new", "3".to_string());
        assert!(cache.get("live").is_some());
        assert!(cache.get("new").is_some());
        assert_eq!(cache.metrics().expirations, 1);
        assert_eq!(cache.metrics().evictions, 0);
    }

    #[test]
    fn test_invalidate_single_key() {
        let (cache, _clock) = cache_with_clock(10, 60);
        cache.put("k1", "v1".to_string());
        cache.invalidate("k1");
        assert_eq!(cache.get("k1"), None);
        assert_eq!(cache.metrics().invalidations, 1);
    }

    #[test]
    fn test_invalidate_prefix_removes_all_matches() {
        let (cache, _clock) = cache_with_clock(10, 60);
        cache.put("memory:episodic:1", "a".to_string());
        cache.put("memory:episodic:2", "b".to_string());
        cache.put("memory:semantic:1", "c".to_string());

        cache.invalidate_prefix("memory:episodic:");

        assert_eq!(cache.get("memory:episodic:1"), None);
        assert_eq!(cache.get("memory:episodic:2"), None);
        assert_eq!(cache.get("memory:semantic:1"), Some("c".to_string()));
        assert_eq!(cache.metrics().invalidations, 2);
    }

    #[test]
    fn test_update_does_not_count_as_eviction() {
        let (cache, _clock) = cache_with_clock(2, 60);
        cache.put("a", "1".to_string());
        cache.put("b", "2".to_string());
        cache.put("a", "1b".to_string());
        assert_eq!(cache.metrics().evictions, 0);
        assert_eq!(cache.get("a"), Some("1b".to_string()));
    }
}
