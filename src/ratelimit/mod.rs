//! Rate Limiting - per-service request budgets
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    RateLimiter                        │
//! │   service "github"   service "weather"   ...          │
//! │  ┌──────────────┐   ┌──────────────┐                  │
//! │  │ TokenBucket  │   │ TokenBucket  │   burst control  │
//! │  │ SlidingWindow│   │ SlidingWindow│   sustained rate │
//! │  └──────────────┘   └──────────────┘                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Admission needs both gates. Denial is a normal outcome carrying a
//! `retry_after_seconds` hint, never an error.

mod limiter;
mod sliding_window;
mod token_bucket;

#[cfg(test)]
mod proptest;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use limiter::{backoff_delay, RateLimiter};
pub use sliding_window::SlidingWindow;
pub use token_bucket::{BucketOutcome, TokenBucket};

/// Fallback requests per minute for services without configuration
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

/// Fallback burst for services without configuration
pub const DEFAULT_BURST: u32 = 30;

// =============================================================================
// Configuration
// =============================================================================

/// Limits for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_limit: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Limiter-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Global switch; when false every check is allowed
    pub enabled: bool,
    pub default_requests_per_minute: u32,
    pub default_burst: u32,
    /// Per-service overrides
    pub services: HashMap<String, RateLimitConfig>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            default_burst: DEFAULT_BURST,
            services: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Decisions and Status
// =============================================================================

/// Snapshot of a service's budget
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub service: String,
    /// Requests admitted in the current window
    pub requests_made: u32,
    pub requests_remaining: u32,
    /// When the oldest request in the window expires
    pub reset_time: DateTime<Utc>,
    /// Set on denial
    pub retry_after_seconds: Option<f64>,
}

impl RateLimitStatus {
    /// Status reported when limiting is switched off
    pub fn unlimited(service: &str) -> Self {
        Self {
            service: service.to_string(),
            requests_made: 0,
            requests_remaining: u32::MAX,
            reset_time: Utc::now(),
            retry_after_seconds: None,
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    Allowed(RateLimitStatus),
    Denied(RateLimitStatus),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed(_))
    }

    pub fn status(&self) -> &RateLimitStatus {
        match self {
            RateLimitDecision::Allowed(status) | RateLimitDecision::Denied(status) => status,
        }
    }

    /// Suggested wait before retrying; `None` when allowed
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitDecision::Allowed(_) => None,
            RateLimitDecision::Denied(status) => status
                .retry_after_seconds
                .map(Duration::from_secs_f64),
        }
    }
}

// =============================================================================
// Usage Bookkeeping
// =============================================================================

/// One outbound request, recorded after the fact
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub service: String,
    pub endpoint: String,
    pub success: bool,
    pub latency: Duration,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated usage for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceUsage {
    pub service: String,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub average_latency_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl ServiceUsage {
    pub fn empty(service: &str) -> Self {
        Self {
            service: service.to_string(),
            total_requests: 0,
            failed_requests: 0,
            average_latency_ms: 0.0,
            last_request_at: None,
        }
    }

    pub fn from_records<'a>(
        service: &str,
        records: impl Iterator<Item = &'a RequestRecord>,
    ) -> Self {
        let mut usage = Self::empty(service);
        let mut total_latency_ms = 0.0;

        for record in records {
            usage.total_requests += 1;
            if !record.success {
                usage.failed_requests += 1;
            }
            total_latency_ms += record.latency.as_secs_f64() * 1000.0;
            usage.last_request_at = Some(
                usage
                    .last_request_at
                    .map_or(record.timestamp, |last| last.max(record.timestamp)),
            );
        }

        if usage.total_requests > 0 {
            usage.average_latency_ms = total_latency_ms / usage.total_requests as f64;
        }
        usage
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            1.0 - self.failed_requests as f64 / self.total_requests as f64
        }
    }
}
