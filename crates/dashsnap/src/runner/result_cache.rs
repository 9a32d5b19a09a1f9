//! Advisory cross-page result cache for the runner.
//!
//! Keyed by (baseline hash, current hash, options fingerprint). A hit
//! skips the comparison entirely; a miss writes after comparison. The
//! cache is advisory: nothing in the run fails because of it.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::diff::{DiffCacheKey, DiffResult};

/// Default entry time-to-live: 7 days.
const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Default size ceiling: 1024 MB.
const DEFAULT_MAX_BYTES: usize = 1024 * 1024 * 1024;
/// Entry-count bound backing the LRU; the byte ceiling is the real limit.
const MAX_ENTRIES: usize = 16_384;

/// Result cache configuration.
#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    pub ttl: Duration,
    pub max_bytes: usize,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

struct Entry {
    result: DiffResult,
    size_bytes: usize,
    stored_at: Instant,
}

struct State {
    entries: LruCache<DiffCacheKey, Entry>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
}

/// LRU result cache with TTL and a byte ceiling.
pub struct ResultCache {
    state: Mutex<State>,
    config: ResultCacheConfig,
}

impl ResultCache {
    pub fn new(config: ResultCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                total_bytes: 0,
                hits: 0,
                misses: 0,
            }),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ResultCacheConfig::default())
    }

    /// Look up a cached result, expiring stale entries on access.
    pub fn get(&self, key: &DiffCacheKey) -> Option<DiffResult> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() > self.config.ttl,
            None => {
                state.misses += 1;
                return None;
            }
        };
        if expired {
            if let Some(entry) = state.entries.pop(key) {
                state.total_bytes = state.total_bytes.saturating_sub(entry.size_bytes);
            }
            state.misses += 1;
            return None;
        }
        state.hits += 1;
        state.entries.get(key).map(|e| e.result.clone())
    }

    /// Store a result, evicting LRU entries past the byte ceiling.
    pub fn insert(&self, key: DiffCacheKey, result: DiffResult) {
        let size_bytes = serde_json::to_vec(&result).map(|v| v.len()).unwrap_or(1024);
        let mut state = self.state.lock();

        if let Some((old_key, old)) = state.entries.push(
            key,
            Entry {
                result,
                size_bytes,
                stored_at: Instant::now(),
            },
        ) {
            state.total_bytes = state.total_bytes.saturating_sub(old.size_bytes);
            let _ = old_key;
        }
        state.total_bytes += size_bytes;

        while state.total_bytes > self.config.max_bytes {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.total_bytes = state.total_bytes.saturating_sub(evicted.size_bytes)
                }
                None => break,
            }
        }
    }

    /// (hits, misses) so far.
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.hits, state.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ImageHash;

    fn key(tag: u8) -> DiffCacheKey {
        DiffCacheKey {
            baseline: ImageHash::from_bytes(&[tag]),
            current: ImageHash::from_bytes(&[tag, 1]),
            options_fingerprint: 7,
        }
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = ResultCache::with_defaults();
        assert!(cache.get(&key(1)).is_none());
        cache.insert(key(1), DiffResult::identical(10));
        assert!(cache.get(&key(1)).is_some());
        assert_eq!(cache.counters(), (1, 1));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResultCache::new(ResultCacheConfig {
            ttl: Duration::from_millis(0),
            max_bytes: DEFAULT_MAX_BYTES,
        });
        cache.insert(key(1), DiffResult::identical(10));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key(1)).is_none());
    }

    #[test]
    fn test_byte_ceiling_evicts_lru() {
        let entry_size = serde_json::to_vec(&DiffResult::identical(10)).unwrap().len();
        let cache = ResultCache::new(ResultCacheConfig {
            ttl: DEFAULT_TTL,
            max_bytes: entry_size * 3,
        });
        for tag in 0..5 {
            cache.insert(key(tag), DiffResult::identical(10));
        }
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(4)).is_some());
    }
}
