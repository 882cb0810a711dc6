//! Memory Cache - the fast local tier
//!
//! A byte-budgeted map with strict LRU eviction. Insert, evict and the size
//! counter are updated under one lock so the accounting stays consistent.
//!
//! # Design
//!
//! - Expiry is lazy: an expired entry is dropped when it is next read
//! - `purge_expired` sweeps entries that are never read again
//! - A tag index maps tag -> keys for tag-based invalidation
//! - A recency index maps access tick -> key, so the eviction victim is
//!   always its first entry

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::entry::CacheEntry;
use super::DEFAULT_MAX_MEMORY_BYTES;

/// Memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Byte budget for stored values
    pub max_size_bytes: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_MEMORY_BYTES,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, CacheEntry>,
    tags: HashMap<String, HashSet<String>>,
    recency: BTreeMap<u64, String>,
    size: u64,
    tick: u64,
}

impl MemoryState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.access_tick());
        self.size -= entry.size();
        for tag in entry.tags() {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn least_recently_used(&self) -> Option<String> {
        self.recency.values().next().cloned()
    }

    /// Move `key` to the most recent position
    fn touch(&mut self, key: &str) -> Option<Bytes> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.access_tick());
        entry.touch(tick);
        self.recency.insert(tick, key.to_string());
        Some(entry.value().clone())
    }
}

/// Memory tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub max_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// The fast, bounded, local cache tier
pub struct MemoryCache {
    config: MemoryCacheConfig,
    state: Mutex<MemoryState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    pub fn with_config(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MemoryState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Read a value, dropping it if expired
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let value = state.touch(key)?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Copy of the stored entry without touching it
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Insert, evicting least-recently-used entries until it fits
    ///
    /// Returns false when the entry alone exceeds the budget.
    pub fn insert(&self, mut entry: CacheEntry) -> bool {
        let size = entry.size();
        if size > self.config.max_size_bytes {
            debug!(
                key = entry.key(),
                size,
                budget = self.config.max_size_bytes,
                "Entry larger than memory budget"
            );
            return false;
        }

        let mut state = self.state.lock();
        state.remove(entry.key());

        while state.size + size > self.config.max_size_bytes {
            let Some(victim) = state.least_recently_used() else {
                break;
            };
            state.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, "Evicted LRU entry");
        }

        let tick = state.next_tick();
        entry.stamp(tick);
        let key = entry.key().to_string();
        for tag in entry.tags() {
            state
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        state.size += size;
        state.recency.insert(tick, key.clone());
        state.entries.insert(key, entry);
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every entry carrying `tag`
    pub fn remove_by_tag(&self, tag: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        keys.iter().filter(|key| state.remove(key).is_some()).count()
    }

    /// Remove every entry whose key contains `pattern`
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.contains(pattern))
            .cloned()
            .collect();

        keys.iter().filter(|key| state.remove(key).is_some()).count()
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key().to_string())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Keys ordered from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.state.lock().recency.values().cloned().collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.tags.clear();
        state.recency.clear();
        state.size = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn capacity(&self) -> u64 {
        self.config.max_size_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> MemoryStats {
        let (entries, size_bytes) = {
            let state = self.state.lock();
            (state.entries.len(), state.size)
        };
        MemoryStats {
            entries,
            size_bytes,
            max_size_bytes: self.config.max_size_bytes,
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
