//! Memory-bounded generic cache with LRU-K eviction.
//!
//! Plain LRU lets one recent touch protect an otherwise cold entry. LRU-K
//! instead ranks entries by their K-th most recent access, so an entry has
//! to sustain K accesses before it earns protection:
//!
//! - Each entry keeps a bounded history of access stamps (at most K+1)
//! - The eviction victim is the entry whose K-th most recent access is
//!   oldest; entries with fewer than K recorded accesses rank as
//!   infinitely old and go first
//! - Eviction never drops the cache below `min_entries`, even when that
//!   means overshooting `max_memory`
//!
//! Memory accounting is exact: the sum of entry sizes always equals
//! `current_memory`, maintained on every insert, delete, and eviction.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Fallback size estimate when a value cannot be serialized for sizing.
pub const DEFAULT_SIZE_ESTIMATE: usize = 256;

/// Milliseconds since the Unix epoch.
pub(crate) fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An access stamp: wall time plus a per-cache sequence number.
///
/// The sequence component makes access ordering total even when two
/// accesses land in the same millisecond, so eviction is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct AccessStamp {
    wall_ms: u64,
    seq: u64,
}

/// Byte-size estimation for cached values.
///
/// Used when `set` is called without an explicit size hint. Estimates are
/// heuristic; exact sizes should be passed as hints where known.
pub trait CacheSize {
    /// Estimated in-memory size of this value in bytes.
    fn cache_size(&self) -> usize;
}

impl CacheSize for String {
    fn cache_size(&self) -> usize {
        // UTF-16 code units, two bytes each.
        self.encode_utf16().count() * 2
    }
}

impl CacheSize for Vec<u8> {
    fn cache_size(&self) -> usize {
        self.len()
    }
}

impl CacheSize for serde_json::Value {
    fn cache_size(&self) -> usize {
        estimate_json_size(self)
    }
}

/// Estimates a value's size from its JSON serialization.
///
/// Falls back to [`DEFAULT_SIZE_ESTIMATE`] when serialization fails
/// (e.g. a map with non-string keys).
pub fn estimate_json_size<T: Serialize>(value: &T) -> usize {
    serde_json::to_string(value)
        .map(|s| s.len() * 2)
        .unwrap_or(DEFAULT_SIZE_ESTIMATE)
}

/// Configuration for a [`SmartCache`].
#[derive(Debug, Clone)]
pub struct SmartCacheConfig {
    /// Memory budget in bytes.
    pub max_memory: usize,
    /// The K in LRU-K: how many recent accesses to track per entry.
    pub k: usize,
    /// Never evict below this many entries, regardless of memory pressure.
    pub min_entries: usize,
    /// Whether to accumulate access-latency metrics on `get`.
    pub enable_metrics: bool,
}

impl Default for SmartCacheConfig {
    fn default() -> Self {
        Self {
            max_memory: 32 * 1024 * 1024, // 32MB
            k: 2,
            min_entries: 8,
            enable_metrics: true,
        }
    }
}

/// A single cache entry with its access bookkeeping.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    size: usize,
    /// Most recent access at the back; bounded to K+1 stamps.
    access_history: VecDeque<AccessStamp>,
    created_at_ms: u64,
    hit_count: u64,
}

impl<V> CacheEntry<V> {
    fn record_access(&mut self, stamp: AccessStamp, k: usize) {
        self.access_history.push_back(stamp);
        while self.access_history.len() > k + 1 {
            self.access_history.pop_front();
        }
    }

    /// Eviction rank: smallest ranks are evicted first.
    ///
    /// Entries with a full K-access history rank by their K-th most recent
    /// stamp; entries with fewer accesses rank below all of them, ordered
    /// by their oldest recorded access.
    fn eviction_rank(&self, k: usize) -> (bool, AccessStamp) {
        let len = self.access_history.len();
        if len >= k {
            (true, self.access_history[len - k])
        } else {
            let oldest = self
                .access_history
                .front()
                .copied()
                .unwrap_or(AccessStamp { wall_ms: 0, seq: 0 });
            (false, oldest)
        }
    }
}

/// Point-in-time cache metrics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    /// Number of `get` calls that found an entry.
    pub hits: u64,
    /// Number of `get` calls that found nothing.
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when there have been no accesses.
    pub hit_rate: f64,
    /// Number of entries removed by memory pressure.
    pub evictions: u64,
    /// Current number of entries.
    pub entry_count: usize,
    /// Current tracked memory in bytes.
    pub memory_bytes: usize,
    /// Average wall-clock time spent inside `get`, in microseconds.
    /// Zero unless `enable_metrics` is set.
    pub avg_access_latency_us: f64,
    /// Entry ages bucketed from `created_at`.
    pub age_histogram: AgeHistogram,
}

/// Entry ages bucketed by creation time.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AgeHistogram {
    /// Entries younger than one minute.
    pub recent: usize,
    /// Entries between one and five minutes old.
    pub medium: usize,
    /// Entries five minutes old or older.
    pub old: usize,
}

/// A memory-bounded cache with LRU-K eviction.
///
/// Keys are strings; values are arbitrary. The cache tracks its total
/// memory footprint from per-entry size estimates and evicts on insert
/// until the new entry fits (never dropping below `min_entries`).
#[derive(Debug)]
pub struct SmartCache<V> {
    config: SmartCacheConfig,
    entries: HashMap<String, CacheEntry<V>>,
    current_memory: usize,
    /// Monotonic access sequence, shared by all entries.
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    get_time: Duration,
    timed_gets: u64,
}

impl<V> SmartCache<V> {
    /// Creates a cache with the given configuration. `k` is clamped to 1.
    pub fn new(mut config: SmartCacheConfig) -> Self {
        config.k = config.k.max(1);
        Self {
            config,
            entries: HashMap::new(),
            current_memory: 0,
            seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            get_time: Duration::ZERO,
            timed_gets: 0,
        }
    }

    fn next_stamp(&mut self) -> AccessStamp {
        self.seq += 1;
        AccessStamp {
            wall_ms: wall_ms(),
            seq: self.seq,
        }
    }

    /// Looks up a key, recording the access on hit.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let started = self.config.enable_metrics.then(Instant::now);
        let stamp = self.next_stamp();
        let k = self.config.k;

        let hit = match self.entries.get_mut(key) {
            Some(entry) => {
                entry.record_access(stamp, k);
                entry.hit_count += 1;
                true
            }
            None => false,
        };

        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        if let Some(start) = started {
            self.get_time += start.elapsed();
            self.timed_gets += 1;
        }

        if hit {
            self.entries.get(key).map(|e| &e.value)
        } else {
            None
        }
    }

    /// Inserts a value, evicting as needed to make room.
    ///
    /// Replacing an existing key removes it first and re-inserts fresh:
    /// the old access history does not carry over. Without a size hint the
    /// value's [`CacheSize`] estimate is used. The insert does not return
    /// until the required room has actually been made.
    pub fn set(&mut self, key: impl Into<String>, value: V, size_hint: Option<usize>)
    where
        V: CacheSize,
    {
        let key = key.into();
        let size = size_hint.unwrap_or_else(|| value.cache_size());

        if let Some(old) = self.entries.remove(&key) {
            self.current_memory -= old.size;
        }
        self.make_room(size);

        let stamp = self.next_stamp();
        let mut access_history = VecDeque::with_capacity(self.config.k + 1);
        access_history.push_back(stamp);

        self.current_memory += size;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                size,
                access_history,
                created_at_ms: stamp.wall_ms,
                hit_count: 0,
            },
        );
    }

    /// Returns whether a key is present, without recording an access.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.current_memory -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Removes all entries. Metric counters are cumulative and survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_memory = 0;
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current tracked memory in bytes.
    pub fn current_memory(&self) -> usize {
        self.current_memory
    }

    /// Computes point-in-time metrics.
    pub fn metrics(&self) -> CacheMetrics {
        let accesses = self.hits + self.misses;
        let hit_rate = if accesses == 0 {
            0.0
        } else {
            self.hits as f64 / accesses as f64
        };
        let avg_access_latency_us = if self.timed_gets == 0 {
            0.0
        } else {
            self.get_time.as_micros() as f64 / self.timed_gets as f64
        };

        let now = wall_ms();
        let mut age_histogram = AgeHistogram::default();
        for entry in self.entries.values() {
            let age_ms = now.saturating_sub(entry.created_at_ms);
            if age_ms < 60_000 {
                age_histogram.recent += 1;
            } else if age_ms < 300_000 {
                age_histogram.medium += 1;
            } else {
                age_histogram.old += 1;
            }
        }

        CacheMetrics {
            hits: self.hits,
            misses: self.misses,
            hit_rate,
            evictions: self.evictions,
            entry_count: self.entries.len(),
            memory_bytes: self.current_memory,
            avg_access_latency_us,
            age_histogram,
        }
    }

    fn make_room(&mut self, incoming: usize) {
        while self.current_memory.saturating_add(incoming) > self.config.max_memory
            && self.entries.len() > self.config.min_entries
        {
            if !self.evict_one() {
                break;
            }
        }
    }

    fn evict_one(&mut self) -> bool {
        let k = self.config.k;
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.eviction_rank(k))
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                if let Some(entry) = self.entries.remove(&key) {
                    self.current_memory -= entry.size;
                    self.evictions += 1;
                    debug!(key = %key, size = entry.size, "evicted cache entry");
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_cache(max_memory: usize, min_entries: usize) -> SmartCache<String> {
        SmartCache::new(SmartCacheConfig {
            max_memory,
            k: 2,
            min_entries,
            enable_metrics: true,
        })
    }

    #[test]
    fn get_and_set_roundtrip() {
        let mut cache = small_cache(1024, 0);
        cache.set("a", "hello".to_string(), Some(10));
        assert_eq!(cache.get("a"), Some(&"hello".to_string()));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn lru2_evicts_sparse_entry_where_plain_lru_would_not() {
        // A is accessed three times, B only once (most recently). Plain
        // LRU would evict A; LRU-2 evicts B because B never reached two
        // accesses.
        let mut cache = small_cache(25, 0);
        cache.set("a", "x".to_string(), Some(10));
        cache.get("a");
        cache.get("a");
        cache.set("b", "y".to_string(), Some(10));

        // 10 + 10 + 10 > 25: one eviction needed.
        cache.set("c", "z".to_string(), Some(10));

        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn lru2_ignores_single_recent_touch() {
        // Both entries have full histories. A's second-most-recent access
        // is older than B's even though A was touched last, so A goes.
        let mut cache = small_cache(25, 0);
        cache.set("a", "x".to_string(), Some(10)); // a: [1]
        cache.get("a"); // a: [1, 2]
        cache.set("b", "y".to_string(), Some(10)); // b: [3]
        cache.get("b"); // b: [3, 4]
        cache.get("a"); // a: [1, 2, 5] -> kth = 2; b kth = 3

        cache.set("c", "z".to_string(), Some(10));

        assert!(!cache.has("a"));
        assert!(cache.has("b"));
        assert!(cache.has("c"));
    }

    #[test]
    fn never_evicts_below_min_entries() {
        let mut cache = small_cache(10, 2);
        for (i, key) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            cache.set(*key, "x".to_string(), Some(100));
            assert!(cache.len() >= 2.min(i + 1));
        }

        // Each insert may evict down to the floor but never through it;
        // the memory overshoot is tolerated.
        assert_eq!(cache.len(), 3);
        assert!(cache.current_memory() > 10);
        assert_eq!(cache.metrics().evictions, 2);
    }

    #[test]
    fn replace_resets_access_history() {
        let mut cache = small_cache(1024, 0);
        cache.set("a", "one".to_string(), Some(10));
        cache.get("a");
        cache.get("a");

        cache.set("a", "two".to_string(), Some(10));
        let entry = cache.entries.get("a").unwrap();
        assert_eq!(entry.hit_count, 0);
        assert_eq!(entry.access_history.len(), 1);
        assert_eq!(entry.value, "two");
    }

    #[test]
    fn replace_adjusts_memory_before_reinsert() {
        let mut cache = small_cache(1024, 0);
        cache.set("a", "one".to_string(), Some(100));
        cache.set("a", "two".to_string(), Some(40));
        assert_eq!(cache.current_memory(), 40);
    }

    #[test]
    fn delete_adjusts_memory() {
        let mut cache = small_cache(1024, 0);
        cache.set("a", "x".to_string(), Some(64));
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.current_memory(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_resets_entries_and_memory() {
        let mut cache = small_cache(1024, 0);
        cache.set("a", "x".to_string(), Some(10));
        cache.set("b", "y".to_string(), Some(10));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.current_memory(), 0);
    }

    #[test]
    fn hit_rate_is_zero_without_accesses() {
        let cache: SmartCache<String> = SmartCache::new(SmartCacheConfig::default());
        assert_eq!(cache.metrics().hit_rate, 0.0);
    }

    #[test]
    fn metrics_track_hits_and_misses() {
        let mut cache = small_cache(1024, 0);
        cache.set("a", "x".to_string(), Some(10));
        cache.get("a");
        cache.get("nope");

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hit_rate, 0.5);
        assert_eq!(metrics.entry_count, 1);
        assert_eq!(metrics.memory_bytes, 10);
    }

    #[test]
    fn age_histogram_counts_fresh_entries_as_recent() {
        let mut cache = small_cache(1024, 0);
        cache.set("a", "x".to_string(), Some(10));
        let histogram = cache.metrics().age_histogram;
        assert_eq!(histogram.recent, 1);
        assert_eq!(histogram.medium, 0);
        assert_eq!(histogram.old, 0);
    }

    #[test]
    fn string_size_estimate_uses_utf16_units() {
        assert_eq!("abc".to_string().cache_size(), 6);
        // One astral-plane char = two UTF-16 units.
        assert_eq!("\u{1F600}".to_string().cache_size(), 4);
    }

    #[test]
    fn json_size_estimate_from_serialization() {
        let value = serde_json::json!({"a": 1});
        assert_eq!(value.cache_size(), estimate_json_size(&value));
        assert!(value.cache_size() > 0);
    }

    #[test]
    fn has_does_not_record_an_access() {
        let mut cache = small_cache(1024, 0);
        cache.set("a", "x".to_string(), Some(10));
        cache.has("a");
        cache.has("a");
        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.misses, 0);
    }

    #[test]
    fn eviction_is_synchronous_with_insert() {
        let mut cache = small_cache(30, 0);
        for i in 0..10 {
            cache.set(format!("k{i}"), "v".to_string(), Some(10));
            assert!(cache.current_memory() <= 30);
        }
    }

    fn tracked_sum(cache: &SmartCache<String>) -> usize {
        cache.entries.values().map(|e| e.size).sum()
    }

    proptest! {
        /// The sum of entry sizes equals `current_memory` after any
        /// sequence of set/get/delete operations.
        #[test]
        fn memory_accounting_invariant(ops in prop::collection::vec(
            (0u8..3, 0usize..8, 1usize..100), 0..200
        )) {
            let mut cache = small_cache(300, 2);
            for (op, key_idx, size) in ops {
                let key = format!("key-{key_idx}");
                match op {
                    0 => cache.set(key, "value".to_string(), Some(size)),
                    1 => { cache.get(&key); }
                    _ => { cache.delete(&key); }
                }
                prop_assert_eq!(tracked_sum(&cache), cache.current_memory());
            }
        }
    }
}
