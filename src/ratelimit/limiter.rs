//! Rate Limiter - per-service admission control
//!
//! Every service owns one token bucket (burst) and one sliding window
//! (sustained rate). A call is admitted only when both have room.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::sliding_window::SlidingWindow;
use super::token_bucket::{BucketOutcome, TokenBucket};
use super::{
    RateLimitConfig, RateLimitDecision, RateLimitStatus, RateLimiterConfig, RequestRecord,
    ServiceUsage,
};
use crate::error::{Error, Result};
use crate::telemetry;

/// Sustained-rate window length
const WINDOW: Duration = Duration::from_secs(60);

/// Requests kept per service for `usage`
const REQUEST_LOG_CAPACITY: usize = 1000;

/// Backoff schedule for `execute_with_backoff`
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Limiter state for one service
#[derive(Debug)]
struct ServiceLimiter {
    config: RateLimitConfig,
    bucket: TokenBucket,
    window: SlidingWindow,
}

impl ServiceLimiter {
    fn new(config: RateLimitConfig) -> Self {
        let refill_rate = f64::from(config.requests_per_minute.max(1)) / WINDOW.as_secs_f64();
        Self {
            bucket: TokenBucket::new(config.burst_limit, refill_rate),
            window: SlidingWindow::new(config.requests_per_minute.max(1) as usize, WINDOW),
            config,
        }
    }

    fn status(&self, service: &str, now: Instant, retry_after: Option<Duration>) -> RateLimitStatus {
        let made = self.window.count_at(now);
        let window_remaining = self.window.remaining_at(now);
        let bucket_remaining = self.bucket.available_at(now).floor() as usize;

        RateLimitStatus {
            service: service.to_string(),
            requests_made: made as u32,
            requests_remaining: window_remaining.min(bucket_remaining) as u32,
            reset_time: Utc::now()
                + chrono::Duration::from_std(self.window.reset_in(now)).unwrap_or_default(),
            retry_after_seconds: retry_after.map(|d| d.as_secs_f64()),
        }
    }
}

/// Per-service rate limiter
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct RateLimiter {
    config: RateLimiterConfig,
    services: DashMap<String, Arc<ServiceLimiter>>,
    requests: DashMap<String, Mutex<VecDeque<RequestRecord>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let limiter = Self {
            services: DashMap::new(),
            requests: DashMap::new(),
            config,
        };
        for (service, service_config) in &limiter.config.services {
            limiter.services.insert(
                service.clone(),
                Arc::new(ServiceLimiter::new(service_config.clone())),
            );
        }
        limiter
    }

    /// Limiter that admits everything
    pub fn disabled() -> Self {
        Self::new(RateLimiterConfig {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Services that currently have limiter state
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Configured limits for a service (default budget if unknown)
    pub fn limits(&self, service: &str) -> RateLimitConfig {
        self.service(service).config.clone()
    }

    fn service(&self, service: &str) -> Arc<ServiceLimiter> {
        if let Some(existing) = self.services.get(service) {
            return existing.clone();
        }
        self.services
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service, "Creating default rate limit budget");
                Arc::new(ServiceLimiter::new(RateLimitConfig {
                    requests_per_minute: self.config.default_requests_per_minute,
                    burst_limit: self.config.default_burst,
                    enabled: true,
                }))
            })
            .clone()
    }

    /// Admission check; never blocks
    pub fn check(&self, service: &str, cost: u32) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::Allowed(RateLimitStatus::unlimited(service));
        }

        let limiter = self.service(service);
        if !limiter.config.enabled {
            return RateLimitDecision::Allowed(RateLimitStatus::unlimited(service));
        }

        let now = Instant::now();
        let decision = match limiter.bucket.try_consume_at(cost, now) {
            BucketOutcome::Consumed { .. } => {
                if limiter.window.try_acquire_at(cost as usize, now) {
                    RateLimitDecision::Allowed(limiter.status(service, now, None))
                } else {
                    limiter.bucket.refund(cost);
                    let wait = limiter.window.time_until(cost as usize, now);
                    RateLimitDecision::Denied(limiter.status(service, now, Some(wait)))
                }
            }
            BucketOutcome::Insufficient { wait, .. } => {
                let wait = wait.max(limiter.window.time_until(cost as usize, now));
                RateLimitDecision::Denied(limiter.status(service, now, Some(wait)))
            }
        };

        telemetry::record_rate_limit_decision(service, decision.is_allowed());
        if let RateLimitDecision::Denied(status) = &decision {
            debug!(
                service,
                retry_after = ?status.retry_after_seconds,
                "Rate limit denied"
            );
        }
        decision
    }

    /// Non-consuming status
    pub fn status(&self, service: &str) -> RateLimitStatus {
        if !self.config.enabled {
            return RateLimitStatus::unlimited(service);
        }
        let limiter = self.service(service);
        if !limiter.config.enabled {
            return RateLimitStatus::unlimited(service);
        }
        limiter.status(service, Instant::now(), None)
    }

    /// Wait until a single request is admitted or `max_wait` runs out
    #[instrument(skip(self))]
    pub async fn wait(&self, service: &str, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let retry_after = match self.check(service, 1) {
                RateLimitDecision::Allowed(_) => return true,
                RateLimitDecision::Denied(status) => status
                    .retry_after_seconds
                    .map(Duration::from_secs_f64)
                    .unwrap_or(Duration::from_millis(100)),
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(service, ?max_wait, "Timed out waiting for rate limit");
                return false;
            }
            // Never oversleep the deadline; always make some progress.
            let nap = retry_after
                .min(deadline - now)
                .max(Duration::from_millis(10));
            tokio::time::sleep(nap).await;
        }
    }

    /// Post-hoc bookkeeping; does not affect admission
    pub fn record(
        &self,
        service: &str,
        endpoint: &str,
        success: bool,
        latency: Duration,
        metadata: HashMap<String, String>,
    ) {
        let record = RequestRecord {
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            success,
            latency,
            metadata,
            timestamp: Utc::now(),
        };

        let log = self
            .requests
            .entry(service.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut log = log.lock();
        if log.len() >= REQUEST_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Aggregated usage for one service
    pub fn usage(&self, service: &str) -> ServiceUsage {
        match self.requests.get(service) {
            Some(log) => ServiceUsage::from_records(service, log.lock().iter()),
            None => ServiceUsage::empty(service),
        }
    }

    /// Aggregated usage for every service with recorded requests
    pub fn all_usage(&self) -> Vec<ServiceUsage> {
        let mut usage: Vec<ServiceUsage> = self
            .requests
            .iter()
            .map(|entry| ServiceUsage::from_records(entry.key(), entry.value().lock().iter()))
            .collect();
        usage.sort_by(|a, b| a.service.cmp(&b.service));
        usage
    }

    /// Recent request records for one service, oldest first
    pub fn recent_requests(&self, service: &str, limit: usize) -> Vec<RequestRecord> {
        self.requests
            .get(service)
            .map(|log| {
                let log = log.lock();
                let skip = log.len().saturating_sub(limit);
                log.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Drop request records older than `cutoff`
    pub fn purge_requests_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for entry in self.requests.iter() {
            let mut log = entry.value().lock();
            let before = log.len();
            log.retain(|record| record.timestamp >= cutoff);
            removed += before - log.len();
        }
        self.requests.retain(|_, log| !log.get_mut().is_empty());
        removed
    }

    /// Restore a service to a full budget and clear its history
    pub fn reset(&self, service: &str) {
        if let Some(limiter) = self.services.get(service) {
            limiter.bucket.reset();
            limiter.window.clear();
        }
        self.requests.remove(service);
        info!(service, "Rate limit reset");
    }

    /// Replace a service's limits; usage in the current window is forgotten
    pub fn update_limits(&self, service: &str, requests_per_minute: u32, burst_limit: u32) {
        let config = RateLimitConfig {
            requests_per_minute,
            burst_limit,
            enabled: true,
        };
        self.services
            .insert(service.to_string(), Arc::new(ServiceLimiter::new(config)));
        info!(
            service,
            requests_per_minute, burst_limit, "Rate limits updated"
        );
    }

    /// Run an outbound call under the limiter with exponential backoff
    ///
    /// Each attempt first waits for admission (bounded by the backoff cap),
    /// then runs `op`. Failures are recorded and retried after 1s, 2s, 4s...
    /// capped at 60s.
    pub async fn execute_with_backoff<T, E, F, Fut>(
        &self,
        service: &str,
        endpoint: &str,
        max_attempts: u32,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if !self.wait(service, BACKOFF_MAX).await {
                return Err(Error::RateLimitExceeded {
                    service: service.to_string(),
                });
            }

            let started = Instant::now();
            match op().await {
                Ok(value) => {
                    self.record(service, endpoint, true, started.elapsed(), HashMap::new());
                    return Ok(value);
                }
                Err(e) => {
                    last_error = e.to_string();
                    let mut metadata = HashMap::new();
                    metadata.insert("attempt".to_string(), (attempt + 1).to_string());
                    metadata.insert("error".to_string(), last_error.clone());
                    self.record(service, endpoint, false, started.elapsed(), metadata);

                    if attempt + 1 < max_attempts {
                        let delay = backoff_delay(attempt);
                        warn!(
                            service,
                            endpoint,
                            attempt = attempt + 1,
                            ?delay,
                            error = %last_error,
                            "Outbound call failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::RetriesExhausted {
            service: service.to_string(),
            attempts: max_attempts,
            reason: last_error,
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

/// Exponential backoff for the zero-based `attempt`
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn limiter_with(service: &str, rpm: u32, burst: u32) -> RateLimiter {
        let mut config = RateLimiterConfig::default();
        config.services.insert(
            service.to_string(),
            RateLimitConfig {
                requests_per_minute: rpm,
                burst_limit: burst,
                enabled: true,
            },
        );
        RateLimiter::new(config)
    }

    #[test]
    fn test_burst_then_denied() {
        let limiter = limiter_with("x", 60, 2);

        assert!(limiter.check("x", 1).is_allowed());
        assert!(limiter.check("x", 1).is_allowed());

        let denied = limiter.check("x", 1);
        assert_matches!(denied, RateLimitDecision::Denied(_));
        let retry_after = denied.status().retry_after_seconds.unwrap();
        assert!(retry_after > 0.0);
        assert!(retry_after <= 1.0);
    }

    #[test]
    fn test_status_counts_requests() {
        let limiter = limiter_with("github", 100, 10);
        limiter.check("github", 1);
        limiter.check("github", 3);

        let status = limiter.status("github");
        assert_eq!(status.requests_made, 4);
        assert_eq!(status.requests_remaining, 6);
        assert!(status.retry_after_seconds.is_none());
    }

    #[test]
    fn test_window_caps_sustained_rate() {
        // Bucket larger than the window: the window is the stricter gate.
        let limiter = limiter_with("weather", 3, 10);
        for _ in 0..3 {
            assert!(limiter.check("weather", 1).is_allowed());
        }
        let denied = limiter.check("weather", 1);
        assert!(!denied.is_allowed());
        assert!(denied.status().retry_after_seconds.unwrap() > 50.0);

        // The refunded token keeps the bucket balance honest.
        assert!(limiter.service("weather").bucket.available() >= 6.9);
    }

    #[test]
    fn test_unknown_service_gets_default_budget() {
        let limiter = RateLimiter::default();
        assert!(limiter.check("spotify", 1).is_allowed());

        let limits = limiter.limits("spotify");
        assert_eq!(limits.requests_per_minute, 60);
        assert_eq!(limits.burst_limit, 30);
        assert_eq!(limiter.services(), vec!["spotify".to_string()]);
    }

    #[test]
    fn test_disabled_is_unlimited() {
        let limiter = RateLimiter::disabled();
        for _ in 0..1000 {
            assert!(limiter.check("anything", 5).is_allowed());
        }
        let status = limiter.status("anything");
        assert_eq!(status.requests_remaining, u32::MAX);
    }

    #[test]
    fn test_disabled_service_is_unlimited() {
        let mut config = RateLimiterConfig::default();
        config.services.insert(
            "internal".to_string(),
            RateLimitConfig {
                requests_per_minute: 1,
                burst_limit: 1,
                enabled: false,
            },
        );
        let limiter = RateLimiter::new(config);
        for _ in 0..10 {
            assert!(limiter.check("internal", 1).is_allowed());
        }
    }

    #[test]
    fn test_reset_restores_budget() {
        let limiter = limiter_with("x", 60, 1);
        assert!(limiter.check("x", 1).is_allowed());
        assert!(!limiter.check("x", 1).is_allowed());

        limiter.reset("x");
        assert!(limiter.check("x", 1).is_allowed());
    }

    #[test]
    fn test_update_limits() {
        let limiter = limiter_with("x", 60, 1);
        limiter.check("x", 1);
        limiter.update_limits("x", 120, 5);

        let limits = limiter.limits("x");
        assert_eq!(limits.requests_per_minute, 120);
        assert_eq!(limits.burst_limit, 5);
        for _ in 0..5 {
            assert!(limiter.check("x", 1).is_allowed());
        }
    }

    #[test]
    fn test_record_and_usage() {
        let limiter = RateLimiter::default();
        limiter.record("github", "/repos", true, Duration::from_millis(100), HashMap::new());
        limiter.record("github", "/repos", false, Duration::from_millis(300), HashMap::new());
        limiter.record("weather", "/current", true, Duration::from_millis(50), HashMap::new());

        let usage = limiter.usage("github");
        assert_eq!(usage.total_requests, 2);
        assert_eq!(usage.failed_requests, 1);
        assert_eq!(usage.average_latency_ms, 200.0);
        assert!(usage.last_request_at.is_some());

        assert_eq!(limiter.all_usage().len(), 2);
        assert_eq!(limiter.recent_requests("github", 1)[0].latency, Duration::from_millis(300));
        assert_eq!(limiter.usage("unknown").total_requests, 0);
    }

    #[test]
    fn test_purge_requests_before() {
        let limiter = RateLimiter::default();
        limiter.record("github", "/repos", true, Duration::from_millis(10), HashMap::new());
        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        assert_eq!(limiter.purge_requests_before(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(limiter.purge_requests_before(cutoff), 1);
        assert!(limiter.all_usage().is_empty());
    }

    #[test]
    fn test_backoff_delay_is_exponential_and_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_wait_admits_after_refill() {
        // 600 rpm refills one token every 100ms.
        let limiter = limiter_with("fast", 600, 1);
        assert!(limiter.check("fast", 1).is_allowed());

        let start = Instant::now();
        assert!(limiter.wait("fast", Duration::from_secs(2)).await);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let limiter = limiter_with("slow", 1, 1);
        assert!(limiter.check("slow", 1).is_allowed());
        assert!(!limiter.wait("slow", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_execute_with_backoff_success() {
        let limiter = RateLimiter::default();
        let result: Result<u32> = limiter
            .execute_with_backoff("github", "/user", 3, || async { Ok::<_, String>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(limiter.usage("github").total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_backoff_exhausts() {
        let limiter = RateLimiter::default();
        let mut calls = 0;
        let result: Result<()> = limiter
            .execute_with_backoff("github", "/user", 3, || {
                calls += 1;
                async { Err::<(), _>("boom") }
            })
            .await;

        assert_matches!(result, Err(Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(calls, 3);
        assert_eq!(limiter.usage("github").failed_requests, 3);
    }
}
