//! Tiered Cache - memory in front of an optional network store
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     CacheManager                         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Memory (local)    byte budget, strict LRU, lazy expiry   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Network (shared)  Redis / in-memory, best effort         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads go memory, then network (backfilling memory), then the caller's
//! fetch. Network failures never surface as errors.

mod entry;
mod manager;
mod memory;
mod network;

#[cfg(test)]
mod proptest;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use entry::{normalize_key, CacheEntry};
pub use manager::CacheManager;
pub use memory::{MemoryCache, MemoryCacheConfig, MemoryStats};
pub use network::{
    InMemoryNetworkStore, NetworkCache, NetworkStats, NetworkStore, RedisStore,
    DEFAULT_OPERATION_TIMEOUT,
};

/// Default memory budget (64 MiB)
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Default time-to-live when no rule matches
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Local, bounded
    Memory,
    /// Shared, optional
    Network,
}

impl CacheTier {
    pub const ALL: [CacheTier; 2] = [CacheTier::Memory, CacheTier::Network];
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Memory => write!(f, "memory"),
            CacheTier::Network => write!(f, "network"),
        }
    }
}

/// Key substring to TTL mapping; first match wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlRule {
    pub pattern: String,
    pub seconds: u64,
}

impl TtlRule {
    pub fn new(pattern: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            seconds: ttl.as_secs(),
        }
    }
}

/// The stock TTL table for the garden backend's keys
pub fn default_ttl_rules() -> Vec<TtlRule> {
    vec![
        TtlRule::new("repo", Duration::from_secs(60 * 60)),
        TtlRule::new("commit", Duration::from_secs(30 * 60)),
        TtlRule::new("current", Duration::from_secs(5 * 60)),
        TtlRule::new("forecast", Duration::from_secs(30 * 60)),
        TtlRule::new("track", Duration::from_secs(10 * 60)),
        TtlRule::new("analytics", Duration::from_secs(15 * 60)),
        TtlRule::new("health", Duration::from_secs(60)),
    ]
}

/// Cache manager configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory: MemoryCacheConfig,
    pub default_ttl: Duration,
    pub ttl_rules: Vec<TtlRule>,
    /// Bound for each network call
    pub network_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryCacheConfig::default(),
            default_ttl: DEFAULT_TTL,
            ttl_rules: default_ttl_rules(),
            network_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Per-call write options
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the TTL table
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Defaults to every tier
    pub tiers: Option<Vec<CacheTier>>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tiers(mut self, tiers: &[CacheTier]) -> Self {
        self.tiers = Some(tiers.to_vec());
        self
    }

    pub(crate) fn includes(&self, tier: CacheTier) -> bool {
        self.tiers
            .as_ref()
            .map_or(true, |tiers| tiers.contains(&tier))
    }
}

/// Combined cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub memory: MemoryStats,
    /// `None` when no network tier is configured
    pub network: Option<NetworkStats>,
    /// Hits over lookups across both tiers
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn network_connected(&self) -> bool {
        self.network.as_ref().is_some_and(|n| n.connected)
    }
}
