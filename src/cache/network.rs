//! Network Cache - the shared remote tier
//!
//! Best-effort access to a shared key/value store. Every failure is logged,
//! counted and swallowed: a broken network tier degrades hit rate, never
//! correctness.
//!
//! # Design
//!
//! - Pluggable store (`RedisStore` in production, `InMemoryNetworkStore`
//!   for tests and single-node setups)
//! - Every call is bounded by an operation timeout
//! - Tags are sets of keys kept next to the values

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

/// Default bound for a single network call
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Remote key/value store behind the network tier
#[async_trait]
pub trait NetworkStore: Send + Sync {
    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.get_with_ttl(key).await?.map(|(value, _)| value))
    }

    /// Get a value with its remaining lifetime (`None` when it never expires)
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>>;

    /// Store a value with expiry
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a value, reporting whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Add a key to a tag set, never shortening the set's expiry
    async fn tag(&self, tag: &str, key: &str, ttl: Duration) -> Result<()>;

    /// Keys currently in a tag set
    async fn tag_members(&self, tag: &str) -> Result<Vec<String>>;

    /// Drop a tag set
    async fn delete_tag(&self, tag: &str) -> Result<()>;

    /// Connectivity check
    async fn ping(&self) -> Result<()>;

    /// Store name for logs
    fn name(&self) -> &'static str;
}

// =============================================================================
// Redis Store
// =============================================================================

/// Redis-backed store
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connect and verify with PING
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(url, "Connected to Redis network cache");
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn build_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    fn build_tag_key(&self, tag: &str) -> String {
        self.build_key(&format!("tag:{}", tag))
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.key_prefix.is_empty() {
            return key;
        }
        key.strip_prefix(&self.key_prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(key)
    }
}

/// SETEX rejects zero, so sub-second TTLs round up
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs_f64().ceil().max(1.0) as u64
}

/// PTTL reply to a lifetime: -1 is no expiry, -2 a missing key
fn remaining_from_pttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

/// New expiry for a tag set given its TTL reply, or `None` to leave it
///
/// A fresh set (no expiry yet) always takes `wanted`; an existing one
/// is only ever extended.
fn extended_tag_expiry(current: i64, wanted: u64) -> Option<u64> {
    match u64::try_from(current) {
        Ok(current) if current >= wanted => None,
        _ => Some(wanted),
    }
}

#[async_trait]
impl NetworkStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.build_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        let mut conn = self.conn.clone();
        let full_key = self.build_key(key);
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&full_key)
            .cmd("PTTL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await?;
        Ok(value.map(|value| (Bytes::from(value), remaining_from_pttl(pttl))))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(self.build_key(key))
            .arg(ttl_seconds(ttl))
            .arg(value.as_ref())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.build_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn tag(&self, tag: &str, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let tag_key = self.build_tag_key(tag);
        let (current,): (i64,) = redis::pipe()
            .cmd("SADD")
            .arg(&tag_key)
            .arg(self.build_key(key))
            .ignore()
            .cmd("TTL")
            .arg(&tag_key)
            .query_async(&mut conn)
            .await?;

        if let Some(seconds) = extended_tag_expiry(current, ttl_seconds(ttl)) {
            let _: i64 = redis::cmd("EXPIRE")
                .arg(&tag_key)
                .arg(seconds)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.build_tag_key(tag))
            .query_async(&mut conn)
            .await?;
        Ok(members
            .iter()
            .map(|member| self.strip_prefix(member).to_string())
            .collect())
    }

    async fn delete_tag(&self, tag: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.build_tag_key(tag))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-process store for tests and single-node deployments
///
/// `set_available(false)` makes every call fail, which simulates an outage.
/// Tag members expire with the TTL they were tagged with.
pub struct InMemoryNetworkStore {
    values: DashMap<String, (Bytes, Instant)>,
    tags: DashMap<String, HashMap<String, Instant>>,
    available: AtomicBool,
}

impl InMemoryNetworkStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            tags: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.values
            .iter()
            .filter(|entry| entry.value().1 > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tag sets still holding a live member
    pub fn tag_count(&self) -> usize {
        let now = Instant::now();
        self.tags
            .iter()
            .filter(|entry| entry.value().values().any(|expires| *expires > now))
            .count()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NetworkCache("store unavailable".to_string()))
        }
    }
}

impl Default for InMemoryNetworkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkStore for InMemoryNetworkStore {
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        self.ensure_available()?;
        let now = Instant::now();
        let expired = match self.values.get(key) {
            Some(entry) if entry.1 > now => {
                return Ok(Some((entry.0.clone(), Some(entry.1 - now))));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        self.values
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.values.remove(key).is_some())
    }

    async fn tag(&self, tag: &str, key: &str, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        let now = Instant::now();
        let expires = now + ttl;
        let mut members = self.tags.entry(tag.to_string()).or_default();
        members.retain(|_, at| *at > now);
        members
            .entry(key.to_string())
            .and_modify(|at| *at = (*at).max(expires))
            .or_insert(expires);
        Ok(())
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let now = Instant::now();
        let Some(mut members) = self.tags.get_mut(tag) else {
            return Ok(Vec::new());
        };
        members.retain(|_, at| *at > now);
        let live: Vec<String> = members.keys().cloned().collect();
        let empty = members.is_empty();
        drop(members);

        if empty {
            self.tags.remove_if(tag, |_, members| members.is_empty());
        }
        Ok(live)
    }

    async fn delete_tag(&self, tag: &str) -> Result<()> {
        self.ensure_available()?;
        self.tags.remove(tag);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

// =============================================================================
// Network Cache
// =============================================================================

/// Network tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub backend: &'static str,
    pub connected: bool,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
}

/// Best-effort wrapper around a [`NetworkStore`]
pub struct NetworkCache {
    store: Arc<dyn NetworkStore>,
    timeout: Duration,
    connected: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl NetworkCache {
    pub fn new(store: Arc<dyn NetworkStore>) -> Self {
        Self::with_timeout(store, DEFAULT_OPERATION_TIMEOUT)
    }

    pub fn with_timeout(store: Arc<dyn NetworkStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            connected: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Run one store call under the timeout, logging and absorbing failures
    async fn guarded<T, F>(&self, op: &'static str, key: &str, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.connected.store(true, Ordering::Relaxed);
                Some(value)
            }
            Ok(Err(e)) => {
                self.record_failure(op, key, &e.to_string());
                None
            }
            Err(_) => {
                self.record_failure(op, key, "timed out");
                None
            }
        }
    }

    fn record_failure(&self, op: &'static str, key: &str, reason: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        warn!(
            backend = self.store.name(),
            op,
            key,
            reason,
            "Network cache operation failed"
        );
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_with_ttl(key).await.map(|(value, _)| value)
    }

    /// Value plus its remaining lifetime in the store
    #[instrument(skip(self), level = "debug")]
    pub async fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Option<Duration>)> {
        let found = self
            .guarded("get", key, self.store.get_with_ttl(key))
            .await
            .flatten();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store a value and register it under its tags
    #[instrument(skip(self, value, tags), level = "debug")]
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration, tags: &[String]) -> bool {
        if self
            .guarded("set", key, self.store.set(key, value, ttl))
            .await
            .is_none()
        {
            return false;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);

        for tag in tags {
            self.guarded("tag", key, self.store.tag(tag, key, ttl)).await;
        }
        debug!(key, ?ttl, "Network cache SET");
        true
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.guarded("delete", key, self.store.delete(key))
            .await
            .unwrap_or(false)
    }

    /// Delete every key registered under `tag`
    pub async fn clear_tag(&self, tag: &str) -> usize {
        let Some(members) = self.guarded("tag_members", tag, self.store.tag_members(tag)).await
        else {
            return 0;
        };

        let mut removed = 0;
        for key in &members {
            if self.delete(key).await {
                removed += 1;
            }
        }
        self.guarded("delete_tag", tag, self.store.delete_tag(tag)).await;
        removed
    }

    /// Probe the store and refresh the connectivity flag
    pub async fn ping(&self) -> bool {
        self.guarded("ping", "", self.store.ping()).await.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            backend: self.store.name(),
            connected: self.is_connected(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_store() -> (NetworkCache, Arc<InMemoryNetworkStore>) {
        let store = Arc::new(InMemoryNetworkStore::new());
        (NetworkCache::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (cache, _) = cache_with_store();
        assert!(cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(60), &[]).await);

        assert_eq!(cache.get("k").await.unwrap().as_ref(), b"v");
        assert!(cache.delete("k").await);
        assert!(cache.get("k").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_store_expiry() {
        let store = InMemoryNetworkStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_outage_is_swallowed() {
        let (cache, store) = cache_with_store();
        store.set_available(false);

        assert!(!cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(60), &[]).await);
        assert!(cache.get("k").await.is_none());
        assert!(!cache.is_connected());
        assert_eq!(cache.stats().errors, 2);

        store.set_available(true);
        assert!(cache.ping().await);
        assert!(cache.is_connected());
    }

    #[tokio::test]
    async fn test_clear_tag() {
        let (cache, _) = cache_with_store();
        let tags = vec!["signal".to_string()];
        let ttl = Duration::from_secs(60);
        cache.set("weather", Bytes::from_static(b"1"), ttl, &tags).await;
        cache.set("music", Bytes::from_static(b"2"), ttl, &tags).await;
        cache.set("layout", Bytes::from_static(b"3"), ttl, &[]).await;

        assert_eq!(cache.clear_tag("signal").await, 2);
        assert!(cache.get("weather").await.is_none());
        assert!(cache.get("layout").await.is_some());
        assert_eq!(cache.clear_tag("signal").await, 0);
    }

    #[tokio::test]
    async fn test_get_with_ttl_reports_remaining_lifetime() {
        let (cache, _) = cache_with_store();
        cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(60), &[]).await;

        let (value, remaining) = cache.get_with_ttl("k").await.unwrap();
        assert_eq!(value.as_ref(), b"v");
        let remaining = remaining.unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }

    #[tokio::test]
    async fn test_short_ttl_does_not_shrink_tag() {
        let (cache, store) = cache_with_store();
        let tags = vec!["signal".to_string()];
        cache.set("repos", Bytes::from_static(b"1"), Duration::from_secs(3600), &tags).await;
        cache.set("weather", Bytes::from_static(b"2"), Duration::from_millis(20), &tags).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.tag_members("signal").await.unwrap(), vec!["repos".to_string()]);

        assert_eq!(cache.clear_tag("signal").await, 1);
        assert!(cache.get("repos").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_tag_members_are_pruned() {
        let store = InMemoryNetworkStore::new();
        store.tag("signal", "weather", Duration::from_millis(10)).await.unwrap();
        store.tag("signal", "music", Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.tag_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.tag_members("signal").await.unwrap().is_empty());
        assert_eq!(store.tag_count(), 0);
        assert!(store.tags.is_empty());
    }

    #[tokio::test]
    async fn test_retag_keeps_longest_expiry() {
        let store = InMemoryNetworkStore::new();
        store.tag("signal", "weather", Duration::from_secs(3600)).await.unwrap();
        store.tag("signal", "weather", Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.tag_members("signal").await.unwrap(), vec!["weather".to_string()]);
    }

    #[test]
    fn test_extended_tag_expiry_only_grows() {
        // Fresh set without expiry.
        assert_eq!(extended_tag_expiry(-1, 300), Some(300));
        assert_eq!(extended_tag_expiry(-2, 300), Some(300));
        assert_eq!(extended_tag_expiry(100, 300), Some(300));
        assert_eq!(extended_tag_expiry(3600, 300), None);
        assert_eq!(extended_tag_expiry(300, 300), None);
    }

    #[test]
    fn test_remaining_from_pttl() {
        assert_eq!(remaining_from_pttl(1500), Some(Duration::from_millis(1500)));
        assert_eq!(remaining_from_pttl(0), Some(Duration::ZERO));
        assert_eq!(remaining_from_pttl(-1), None);
        assert_eq!(remaining_from_pttl(-2), None);
    }

    #[test]
    fn test_ttl_seconds_rounds_up() {
        assert_eq!(ttl_seconds(Duration::from_millis(1)), 1);
        assert_eq!(ttl_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_seconds(Duration::from_secs(300)), 300);
    }
}
