//! Cache Manager - read-through, write-through over both tiers
//!
//! Keys are normalized before they reach either tier, and every value gets a
//! TTL from the rule table unless the caller overrides it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::entry::{normalize_key, CacheEntry};
use super::memory::MemoryCache;
use super::network::{NetworkCache, NetworkStore};
use super::{CacheConfig, CacheStats, CacheTier, SetOptions};
use crate::error::Result;
use crate::telemetry;

/// Two-tier cache
pub struct CacheManager {
    memory: MemoryCache,
    network: Option<NetworkCache>,
    config: CacheConfig,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl CacheManager {
    /// Memory-only cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            memory: MemoryCache::with_config(config.memory.clone()),
            network: None,
            config,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Cache with a network tier behind memory
    pub fn with_network(config: CacheConfig, store: Arc<dyn NetworkStore>) -> Self {
        let network = NetworkCache::with_timeout(store, config.network_timeout);
        Self {
            network: Some(network),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn network(&self) -> Option<&NetworkCache> {
        self.network.as_ref()
    }

    /// TTL for a normalized key: first matching rule, else the default
    pub fn ttl_for(&self, key: &str) -> Duration {
        self.config
            .ttl_rules
            .iter()
            .find(|rule| key.contains(&rule.pattern))
            .map(|rule| Duration::from_secs(rule.seconds))
            .unwrap_or(self.config.default_ttl)
    }

    /// Look a key up in memory, then the network tier
    ///
    /// A network hit is copied into memory for no longer than it has left in
    /// the network tier, capped by the key's default TTL.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let key = normalize_key(key);
        self.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.memory.get(&key) {
            telemetry::record_cache_lookup(CacheTier::Memory, true);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }
        telemetry::record_cache_lookup(CacheTier::Memory, false);

        let network = self.network.as_ref()?;
        match network.get_with_ttl(&key).await {
            Some((value, remaining)) => {
                telemetry::record_cache_lookup(CacheTier::Network, true);
                self.hits.fetch_add(1, Ordering::Relaxed);
                let ttl = backfill_ttl(remaining, self.ttl_for(&key));
                if !ttl.is_zero() {
                    let entry = CacheEntry::new(key.clone(), value.clone()).with_ttl(ttl);
                    self.memory.insert(entry);
                    debug!(key, ?ttl, "Backfilled memory tier from network");
                }
                Some(value)
            }
            None => {
                telemetry::record_cache_lookup(CacheTier::Network, false);
                None
            }
        }
    }

    /// Read-through lookup
    ///
    /// On a miss in both tiers `fetch` runs and its value is stored in both.
    /// A failed fetch is logged and reported as a miss.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> Option<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Bytes>>,
    {
        if let Some(value) = self.get(key).await {
            return Some(value);
        }

        match fetch().await {
            Ok(value) => {
                let options = SetOptions {
                    ttl,
                    ..SetOptions::default()
                };
                self.set(key, value.clone(), options).await;
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "Cache fetch failed");
                None
            }
        }
    }

    /// Typed lookup; undecodable values count as a miss
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Cached value is not valid JSON for the requested type");
                None
            }
        }
    }

    /// Typed write
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, options: SetOptions) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.set(key, Bytes::from(bytes), options).await)
    }

    /// Write to the selected tiers; true if any accepted the value
    #[instrument(skip(self, value, options), fields(size = value.len()), level = "debug")]
    pub async fn set(&self, key: &str, value: Bytes, options: SetOptions) -> bool {
        let key = normalize_key(key);
        let ttl = options.ttl.unwrap_or_else(|| self.ttl_for(&key));
        let mut accepted = false;

        if options.includes(CacheTier::Memory) {
            let entry = CacheEntry::new(key.clone(), value.clone())
                .with_ttl(ttl)
                .with_tags(options.tags.iter().cloned());
            accepted |= self.memory.insert(entry);
        }

        if options.includes(CacheTier::Network) {
            if let Some(network) = &self.network {
                accepted |= network.set(&key, value, ttl, &options.tags).await;
            }
        }

        accepted
    }

    /// Delete from the given tiers (all tiers when `None`)
    pub async fn delete(&self, key: &str, tiers: Option<&[CacheTier]>) -> bool {
        let key = normalize_key(key);
        let includes = |tier: CacheTier| tiers.map_or(true, |tiers| tiers.contains(&tier));
        let mut removed = false;

        if includes(CacheTier::Memory) {
            removed |= self.memory.remove(&key);
        }
        if includes(CacheTier::Network) {
            if let Some(network) = &self.network {
                removed |= network.delete(&key).await;
            }
        }
        removed
    }

    /// Remove everything tagged `tag` from both tiers
    pub async fn clear_by_tag(&self, tag: &str) -> usize {
        let mut removed = self.memory.remove_by_tag(tag);
        if let Some(network) = &self.network {
            removed += network.clear_tag(tag).await;
        }
        info!(tag, removed, "Cleared cache by tag");
        removed
    }

    /// Remove memory entries whose key contains `pattern`
    ///
    /// The network tier is left alone; its entries age out by TTL.
    pub fn clear_by_pattern(&self, pattern: &str) -> usize {
        let removed = self.memory.remove_matching(&normalize_key(pattern));
        info!(pattern, removed, "Cleared cache by pattern");
        removed
    }

    /// Drop expired memory entries
    pub fn purge_expired(&self) -> usize {
        self.memory.purge_expired()
    }

    /// Periodically purge expired entries until `cancel` fires
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }

    /// Refresh network connectivity; true when memory-only or reachable
    pub async fn ping(&self) -> bool {
        match &self.network {
            Some(network) => network.ping().await,
            None => true,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        CacheStats {
            memory: self.memory.stats(),
            network: self.network.as_ref().map(NetworkCache::stats),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

/// Memory lifetime for a value copied up from the network tier
fn backfill_ttl(remaining: Option<Duration>, default: Duration) -> Duration {
    remaining.map_or(default, |remaining| remaining.min(default))
}
