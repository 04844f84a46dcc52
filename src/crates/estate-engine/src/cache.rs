//! Fingerprint-keyed result cache with TTL and eviction policies.
//!
//! Completed answers are cached under a deterministic fingerprint of
//! `(normalized_query, user_id, session_id, language)`; a repeat of the same
//! query within the TTL is served without running any worker. The cache is
//! guarded by an internal mutex and bounded both by entry count and by an
//! estimated memory ceiling. Eviction supports LRU (the default), LFU, FIFO
//! and TTL-only.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::FinalPayload;

fn default_enabled() -> bool {
    true
}

fn default_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_entries() -> usize {
    1000
}

fn default_max_memory_bytes() -> usize {
    32 * 1024 * 1024
}

/// Eviction policy for the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    #[default]
    Lru,
    Lfu,
    Fifo,
    /// Only expired entries are evicted; when full and nothing has expired,
    /// the oldest entry goes.
    Ttl,
}

/// Result cache configuration (spec'd under `cache:` in the engine config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ttl")]
    pub ttl: Duration,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    #[serde(default)]
    pub strategy: EvictionStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl: default_ttl(),
            max_entries: default_max_entries(),
            max_memory_bytes: default_max_memory_bytes(),
            strategy: EvictionStrategy::default(),
        }
    }
}

/// Counters exposed by the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub memory_bytes: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    payload: FinalPayload,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    inserted_seq: u64,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    memory_bytes: usize,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Engine-level result cache.
pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Deterministic lookup key.
    ///
    /// The "relevant context subset" is fixed as the user id, session id and
    /// language tag; normalization lowercases, trims and collapses internal
    /// whitespace so formatting differences do not defeat the cache.
    pub fn fingerprint(query: &str, user_id: &str, session_id: &str, language: &str) -> String {
        let normalized = query
            .trim()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        format!("{normalized}|{user_id}|{session_id}|{language}")
    }

    /// Look up a cached payload. Expired entries are treated as misses and
    /// removed, so every returned value satisfies `created_at + ttl > now`.
    pub fn get(&self, key: &str) -> Option<FinalPayload> {
        if !self.config.enabled {
            return None;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(self.config.ttl),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            if let Some(old) = inner.entries.remove(key) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(old.size_bytes);
            }
            inner.misses += 1;
            return None;
        }

        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                entry.access_count += 1;
                let payload = entry.payload.clone();
                inner.hits += 1;
                Some(payload)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a payload, evicting under the configured policy as needed.
    pub fn put(&self, key: String, payload: FinalPayload) {
        if !self.config.enabled {
            return;
        }

        let size_bytes = serde_json::to_vec(&payload).map(|v| v.len()).unwrap_or(0);
        if size_bytes > self.config.max_memory_bytes {
            tracing::warn!(size_bytes, "result larger than cache memory ceiling, not cached");
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(&key) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(old.size_bytes);
        }

        while inner.entries.len() >= self.config.max_entries
            || inner.memory_bytes + size_bytes > self.config.max_memory_bytes
        {
            if !self.evict_one(&mut inner) {
                break;
            }
        }

        let now = Instant::now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.memory_bytes += size_bytes;
        inner.entries.insert(
            key,
            CacheEntry {
                payload,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                inserted_seq: seq,
                size_bytes,
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            memory_bytes: inner.memory_bytes,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.memory_bytes = 0;
    }

    /// Evict a single victim under the configured policy. Returns false when
    /// nothing can be evicted.
    fn evict_one(&self, inner: &mut CacheInner) -> bool {
        // Expired entries go first regardless of policy.
        let expired_key = inner
            .entries
            .iter()
            .find(|(_, e)| e.is_expired(self.config.ttl))
            .map(|(k, _)| k.clone());

        let victim = expired_key.or_else(|| {
            let entries = &inner.entries;
            match self.config.strategy {
                EvictionStrategy::Lru => entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_accessed)
                    .map(|(k, _)| k.clone()),
                EvictionStrategy::Lfu => entries
                    .iter()
                    .min_by_key(|(_, e)| (e.access_count, e.inserted_seq))
                    .map(|(k, _)| k.clone()),
                EvictionStrategy::Fifo | EvictionStrategy::Ttl => entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_seq)
                    .map(|(k, _)| k.clone()),
            }
        });

        match victim {
            Some(key) => {
                if let Some(old) = inner.entries.remove(&key) {
                    inner.memory_bytes = inner.memory_bytes.saturating_sub(old.size_bytes);
                }
                inner.evictions += 1;
                true
            }
            None => false,
        }
    }
}
