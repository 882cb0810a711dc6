//! Cache Entry Types

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Normalize a caller-supplied key
///
/// Keys are lower-cased and whitespace becomes `_`, so `"Repo List"` and
/// `"repo list"` share a cache line.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect::<String>()
        .to_lowercase()
}

/// A cached value plus bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: String,
    value: Bytes,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    access_count: u64,
    last_accessed: DateTime<Utc>,
    /// Position in the access order; higher is more recent
    access_tick: u64,
    tags: HashSet<String>,
}

impl CacheEntry {
    /// Create an entry with no expiry
    pub fn new(key: impl Into<String>, value: Bytes) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: None,
            access_count: 0,
            last_accessed: now,
            access_tick: 0,
            tags: HashSet::new(),
        }
    }

    /// Set a time-to-live measured from creation
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.created_at + ttl);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Size charged against the memory budget
    #[inline]
    pub fn size(&self) -> u64 {
        self.value.len() as u64
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    pub(crate) fn access_tick(&self) -> u64 {
        self.access_tick
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Remaining lifetime, `None` for entries without expiry
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires| (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Record a read
    pub(crate) fn touch(&mut self, tick: u64) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
        self.access_tick = tick;
    }

    /// Stamp the insertion position in the access order
    pub(crate) fn stamp(&mut self, tick: u64) {
        self.access_tick = tick;
    }
}
