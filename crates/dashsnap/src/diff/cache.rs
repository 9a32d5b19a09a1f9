//! Bounded in-process cache for comparison results.
//!
//! Keyed by (baseline hash, current hash, options fingerprint). Two limits
//! apply at once: an entry-count LRU bound and a total memory ceiling with a
//! low watermark the cache drains to when the ceiling is crossed. Entries
//! above the per-entry limit are never admitted.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

use crate::diff::DiffResult;
use crate::hash::ImageHash;

/// Maximum number of cached comparisons.
pub const MAX_ENTRIES: usize = 100;
/// Total memory ceiling for cached artifacts.
pub const MEMORY_CEILING_BYTES: usize = 100 * 1024 * 1024;
/// Eviction drains the cache to at most this size once the ceiling is hit.
pub const LOW_WATERMARK_BYTES: usize = 75 * 1024 * 1024;
/// Entries at or above this size bypass the cache entirely.
pub const MAX_ENTRY_BYTES: usize = 10 * 1024 * 1024;

/// Cache key: both content hashes plus the options fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiffCacheKey {
    pub baseline: ImageHash,
    pub current: ImageHash,
    pub options_fingerprint: u64,
}

/// Hit/miss statistics for the diff cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl DiffCacheStats {
    /// Hit rate in [0, 1].
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Memory accounting for the diff cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffMemoryStats {
    pub current_bytes: usize,
    pub ceiling_bytes: usize,
    pub low_watermark_bytes: usize,
    /// Entries rejected for exceeding the per-entry size limit.
    pub oversize_rejections: u64,
}

struct CachedDiff {
    result: DiffResult,
    size_bytes: usize,
}

struct CacheState {
    entries: LruCache<DiffCacheKey, CachedDiff>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    oversize_rejections: u64,
}

/// Bounded LRU cache with memory accounting. Mutation is serialized behind
/// a single lock; `compare()` is otherwise side-effect free, so concurrent
/// workers only contend here.
pub struct DiffCache {
    state: Mutex<CacheState>,
}

impl Default for DiffCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffCache {
    pub fn new() -> Self {
        // MAX_ENTRIES is a nonzero constant
        let capacity = NonZeroUsize::new(MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                total_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                oversize_rejections: 0,
            }),
        }
    }

    /// Look up a cached comparison, promoting it on hit.
    pub fn get(&self, key: &DiffCacheKey) -> Option<DiffResult> {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(cached) => {
                let result = cached.result.clone();
                state.hits += 1;
                Some(result)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Insert a comparison result. Oversized entries are rejected; crossing
    /// the memory ceiling drains LRU entries down to the low watermark.
    pub fn insert(&self, key: DiffCacheKey, result: DiffResult, size_bytes: usize) {
        if size_bytes >= MAX_ENTRY_BYTES {
            let mut state = self.state.lock();
            state.oversize_rejections += 1;
            return;
        }

        let mut state = self.state.lock();
        // push surfaces both same-key replacement and capacity eviction, so
        // the byte accounting stays exact
        if let Some((old_key, old)) = state.entries.push(key, CachedDiff { result, size_bytes }) {
            state.total_bytes = state.total_bytes.saturating_sub(old.size_bytes);
            if old_key != key {
                state.evictions += 1;
            }
        }
        state.total_bytes += size_bytes;

        if state.total_bytes > MEMORY_CEILING_BYTES {
            while state.total_bytes > LOW_WATERMARK_BYTES {
                match state.entries.pop_lru() {
                    Some((_, evicted)) => {
                        state.total_bytes = state.total_bytes.saturating_sub(evicted.size_bytes);
                        state.evictions += 1;
                    }
                    None => break,
                }
            }
        }
    }

    /// Hit/miss statistics.
    pub fn stats(&self) -> DiffCacheStats {
        let state = self.state.lock();
        DiffCacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Memory accounting.
    pub fn memory_stats(&self) -> DiffMemoryStats {
        let state = self.state.lock();
        DiffMemoryStats {
            current_bytes: state.total_bytes,
            ceiling_bytes: MEMORY_CEILING_BYTES,
            low_watermark_bytes: LOW_WATERMARK_BYTES,
            oversize_rejections: state.oversize_rejections,
        }
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffResult;

    fn key(tag: u8) -> DiffCacheKey {
        DiffCacheKey {
            baseline: ImageHash::from_bytes(&[tag]),
            current: ImageHash::from_bytes(&[tag, tag]),
            options_fingerprint: u64::from(tag),
        }
    }

    fn result() -> DiffResult {
        DiffResult::identical(100)
    }

    #[test]
    fn test_get_miss_then_hit() {
        let cache = DiffCache::new();
        assert!(cache.get(&key(1)).is_none());

        cache.insert(key(1), result(), 1024);
        assert!(cache.get(&key(1)).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = DiffCache::new();
        cache.insert(key(1), result(), MAX_ENTRY_BYTES);
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.memory_stats().oversize_rejections, 1);

        // One byte under the limit is admitted
        cache.insert(key(2), result(), MAX_ENTRY_BYTES - 1);
        assert!(cache.get(&key(2)).is_some());
    }

    #[test]
    fn test_memory_ceiling_drains_to_watermark() {
        let cache = DiffCache::new();
        // 5 MB per entry: 21 entries crosses the 100 MB ceiling
        let entry_size = 5 * 1024 * 1024;
        for i in 0..21 {
            cache.insert(key(i), result(), entry_size);
        }
        let mem = cache.memory_stats();
        assert!(mem.current_bytes <= LOW_WATERMARK_BYTES);
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn test_entry_count_bound() {
        let cache = DiffCache::new();
        for i in 0..=u8::MAX {
            cache.insert(key(i), result(), 16);
        }
        assert!(cache.stats().entries <= MAX_ENTRIES);
    }

    #[test]
    fn test_lru_order_preserved_on_access() {
        let cache = DiffCache::new();
        let entry_size = 10 * 1024 * 1024 - 1;
        for i in 0..10 {
            cache.insert(key(i), result(), entry_size);
        }
        // Touch the oldest entry, then push past the ceiling
        assert!(cache.get(&key(0)).is_some());
        cache.insert(key(200), result(), entry_size);

        // key(0) was most recently used and must survive the drain
        assert!(cache.get(&key(0)).is_some());
    }

    #[test]
    fn test_clear_resets_memory() {
        let cache = DiffCache::new();
        cache.insert(key(1), result(), 4096);
        cache.clear();
        assert_eq!(cache.memory_stats().current_bytes, 0);
        assert_eq!(cache.stats().entries, 0);
    }
}
