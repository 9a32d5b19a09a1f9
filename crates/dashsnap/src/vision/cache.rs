//! Two-tier vision response cache.
//!
//! A small in-memory LRU sits in front of a persistent SQLite tier. Every
//! write lands in both tiers, so memory evictions lose nothing; reads
//! promote persistent hits back into memory. Hit-rate statistics reflect
//! both tiers together.

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SnapError};
use crate::hash::ImageHash;
use crate::vision::VisionClassification;

/// Configuration for the vision cache.
#[derive(Debug, Clone)]
pub struct VisionCacheConfig {
    /// SQLite file backing the persistent tier.
    pub path: PathBuf,
    /// Memory tier capacity.
    pub memory_capacity: usize,
    /// Persistent entry time-to-live.
    pub ttl: Duration,
}

impl VisionCacheConfig {
    /// Default capacity (100) and TTL (30 days) at the given path.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            memory_capacity: 100,
            ttl: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Cache statistics across both tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisionCacheStats {
    pub memory_size: usize,
    pub persistent_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl VisionCacheStats {
    /// True hit/miss ratio in [0, 1] across both tiers.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Two-tier cache for vision classifications.
///
/// # Example
///
/// ```no_run
/// use dashsnap::vision::{VisionCache, VisionCacheConfig};
///
/// let cache = VisionCache::open(VisionCacheConfig::at_path("cache/vision.db")).unwrap();
/// let stats = cache.stats().unwrap();
/// println!("hit rate {:.1}%", stats.hit_rate() * 100.0);
/// ```
pub struct VisionCache {
    memory: Mutex<LruCache<String, VisionClassification>>,
    conn: Mutex<Connection>,
    counters: Mutex<Counters>,
    ttl: Duration,
}

impl VisionCache {
    /// Open (or create) the cache at the configured path.
    pub fn open(config: VisionCacheConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SnapError::StoreIo(format!("cannot create cache dir: {e}")))?;
        }
        let conn = Connection::open(&config.path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vision_cache (
                key       TEXT PRIMARY KEY,
                value     TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                provider  TEXT NOT NULL,
                model     TEXT NOT NULL,
                hits      INTEGER NOT NULL DEFAULT 0
            );",
        )?;

        let capacity =
            NonZeroUsize::new(config.memory_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            memory: Mutex::new(LruCache::new(capacity)),
            conn: Mutex::new(conn),
            counters: Mutex::new(Counters::default()),
            ttl: config.ttl,
        })
    }

    /// An in-memory-file cache for tests.
    pub fn open_in_memory(memory_capacity: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vision_cache (
                key       TEXT PRIMARY KEY,
                value     TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                provider  TEXT NOT NULL,
                model     TEXT NOT NULL,
                hits      INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        let capacity = NonZeroUsize::new(memory_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            memory: Mutex::new(LruCache::new(capacity)),
            conn: Mutex::new(conn),
            counters: Mutex::new(Counters::default()),
            ttl: Duration::from_secs(30 * 24 * 60 * 60),
        })
    }

    /// Composite key: sha256 over provider, model, and both content hashes.
    pub fn cache_key(
        provider: &str,
        model: &str,
        baseline: &ImageHash,
        current: &ImageHash,
    ) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b":");
        hasher.update(model.as_bytes());
        hasher.update(b":");
        hasher.update(baseline.to_hex().as_bytes());
        hasher.update(b":");
        hasher.update(current.to_hex().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a cached classification.
    ///
    /// Memory hits promote the entry and bump the persistent hit counter.
    /// Memory misses fall through to the persistent tier; non-expired rows
    /// are promoted into memory, expired rows are deleted.
    pub fn get(&self, key: &str) -> Result<Option<VisionClassification>> {
        if let Some(value) = self.memory.lock().get(key).cloned() {
            self.counters.lock().hits += 1;
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE vision_cache SET hits = hits + 1 WHERE key = ?1",
                params![key],
            )?;
            return Ok(Some(value));
        }

        let row: Option<(String, i64)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT value, timestamp FROM vision_cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let Some((value_json, timestamp)) = row else {
            self.counters.lock().misses += 1;
            return Ok(None);
        };

        let age = chrono::Utc::now().timestamp().saturating_sub(timestamp);
        if age > self.ttl.as_secs() as i64 {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM vision_cache WHERE key = ?1", params![key])?;
            self.counters.lock().misses += 1;
            return Ok(None);
        }

        let value: VisionClassification = serde_json::from_str(&value_json)
            .map_err(|e| SnapError::Serialization(e.to_string()))?;

        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE vision_cache SET hits = hits + 1 WHERE key = ?1",
                params![key],
            )?;
        }

        let mut memory = self.memory.lock();
        if memory.push(key.to_string(), value.clone()).is_some() {
            self.counters.lock().evictions += 1;
        }
        self.counters.lock().hits += 1;
        Ok(Some(value))
    }

    /// Write a classification to both tiers.
    pub fn set(
        &self,
        key: &str,
        value: &VisionClassification,
        provider: &str,
        model: &str,
    ) -> Result<()> {
        let value_json = serde_json::to_string(value)
            .map_err(|e| SnapError::Serialization(e.to_string()))?;
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT OR REPLACE INTO vision_cache (key, value, timestamp, provider, model, hits)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![key, value_json, chrono::Utc::now().timestamp(), provider, model],
            )?;
        }

        let mut memory = self.memory.lock();
        let evicted = memory.push(key.to_string(), value.clone());
        if let Some((old_key, _)) = evicted {
            if old_key != key {
                self.counters.lock().evictions += 1;
            }
        }
        Ok(())
    }

    /// Remove a key from both tiers.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.memory.lock().pop(key);
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM vision_cache WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    /// Drop everything from both tiers.
    pub fn clear(&self) -> Result<()> {
        self.memory.lock().clear();
        let conn = self.conn.lock();
        conn.execute("DELETE FROM vision_cache", [])?;
        Ok(())
    }

    /// Delete persistent rows older than the TTL. Returns the number
    /// removed.
    pub fn prune_expired(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp() - self.ttl.as_secs() as i64;
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM vision_cache WHERE timestamp < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Statistics across both tiers.
    pub fn stats(&self) -> Result<VisionCacheStats> {
        let persistent_size: i64 = {
            let conn = self.conn.lock();
            conn.query_row("SELECT COUNT(*) FROM vision_cache", [], |row| row.get(0))?
        };
        // Lock order is memory before counters, matching the hot paths
        let memory_size = self.memory.lock().len();
        let counters = self.counters.lock();
        Ok(VisionCacheStats {
            memory_size,
            persistent_size: persistent_size as usize,
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
        })
    }

    /// Release the underlying store.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner();
        conn.close()
            .map_err(|(_, e)| SnapError::StoreIo(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Severity;
    use crate::vision::VisionCategory;

    fn classification(severity: Severity) -> VisionClassification {
        VisionClassification {
            severity,
            confidence: 0.8,
            reasoning: "header shifted".to_string(),
            categories: vec![VisionCategory::Layout],
            suggestions: Vec::new(),
        }
    }

    fn sample_key(tag: &str) -> String {
        VisionCache::cache_key(
            "ollama",
            "llava",
            &ImageHash::from_bytes(tag.as_bytes()),
            &ImageHash::from_bytes(b"current"),
        )
    }

    #[test]
    fn test_set_get_round_trip() {
        let cache = VisionCache::open_in_memory(10).unwrap();
        let key = sample_key("a");
        let value = classification(Severity::Moderate);

        cache.set(&key, &value, "ollama", "llava").unwrap();
        let got = cache.get(&key).unwrap().unwrap();
        assert_eq!(got.severity, Severity::Moderate);
        assert_eq!(got.categories, value.categories);
    }

    #[test]
    fn test_miss_returns_none() {
        let cache = VisionCache::open_in_memory(10).unwrap();
        assert!(cache.get(&sample_key("missing")).unwrap().is_none());
        let stats = cache.stats().unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_persistent_tier_survives_memory_eviction() {
        let cache = VisionCache::open_in_memory(1).unwrap();
        let key_a = sample_key("a");
        let key_b = sample_key("b");

        cache.set(&key_a, &classification(Severity::Minor), "ollama", "llava").unwrap();
        // Evicts key_a from the memory tier
        cache.set(&key_b, &classification(Severity::Breaking), "ollama", "llava").unwrap();

        // Still served from the persistent tier, then promoted
        let got = cache.get(&key_a).unwrap().unwrap();
        assert_eq!(got.severity, Severity::Minor);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.persistent_size, 2);
        assert!(stats.evictions >= 1);
    }

    #[test]
    fn test_hit_rate_reflects_both_tiers() {
        let cache = VisionCache::open_in_memory(1).unwrap();
        let key_a = sample_key("a");
        let key_b = sample_key("b");
        cache.set(&key_a, &classification(Severity::None), "ollama", "llava").unwrap();
        cache.set(&key_b, &classification(Severity::None), "ollama", "llava").unwrap();

        let _ = cache.get(&key_a).unwrap(); // persistent hit (evicted from memory)
        let _ = cache.get(&key_b).unwrap(); // hit
        let _ = cache.get(&sample_key("zzz")).unwrap(); // miss

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_expired_entry_is_deleted() {
        let cache = VisionCache::open_in_memory(10).unwrap();
        let key = sample_key("stale");
        // Insert a row stamped 31 days in the past, bypassing set()
        {
            let conn = cache.conn.lock();
            conn.execute(
                "INSERT INTO vision_cache (key, value, timestamp, provider, model, hits)
                 VALUES (?1, ?2, ?3, 'ollama', 'llava', 0)",
                params![
                    key,
                    serde_json::to_string(&classification(Severity::Minor)).unwrap(),
                    chrono::Utc::now().timestamp() - 31 * 24 * 60 * 60,
                ],
            )
            .unwrap();
        }

        assert!(cache.get(&key).unwrap().is_none());
        let stats = cache.stats().unwrap();
        assert_eq!(stats.persistent_size, 0);
    }

    #[test]
    fn test_prune_expired() {
        let cache = VisionCache::open_in_memory(10).unwrap();
        {
            let conn = cache.conn.lock();
            for (i, age_days) in [1i64, 40, 45].iter().enumerate() {
                conn.execute(
                    "INSERT INTO vision_cache (key, value, timestamp, provider, model, hits)
                     VALUES (?1, ?2, ?3, 'ollama', 'llava', 0)",
                    params![
                        format!("key-{i}"),
                        serde_json::to_string(&classification(Severity::None)).unwrap(),
                        chrono::Utc::now().timestamp() - age_days * 24 * 60 * 60,
                    ],
                )
                .unwrap();
            }
        }
        let removed = cache.prune_expired().unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.stats().unwrap().persistent_size, 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = VisionCache::open_in_memory(10).unwrap();
        let key = sample_key("a");
        cache.set(&key, &classification(Severity::None), "ollama", "llava").unwrap();

        assert!(cache.delete(&key).unwrap());
        assert!(!cache.delete(&key).unwrap());

        cache.set(&key, &classification(Severity::None), "ollama", "llava").unwrap();
        cache.clear().unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.memory_size, 0);
        assert_eq!(stats.persistent_size, 0);
    }

    #[test]
    fn test_cache_key_is_order_sensitive() {
        let a = ImageHash::from_bytes(b"a");
        let b = ImageHash::from_bytes(b"b");
        assert_ne!(
            VisionCache::cache_key("p", "m", &a, &b),
            VisionCache::cache_key("p", "m", &b, &a)
        );
        assert_ne!(
            VisionCache::cache_key("p1", "m", &a, &b),
            VisionCache::cache_key("p2", "m", &a, &b)
        );
    }
}
