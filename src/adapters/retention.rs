//! Retention Adapters
//!
//! `RetentionStore` implementations for records this process keeps itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::ports::RetentionStore;
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// Outbound request log kept by the rate limiter.
#[derive(Clone)]
pub struct RequestLogRetention {
    limiter: Arc<RateLimiter>,
}

impl RequestLogRetention {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl std::fmt::Debug for RequestLogRetention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLogRetention").finish()
    }
}

#[async_trait]
impl RetentionStore for RequestLogRetention {
    fn name(&self) -> &str {
        "request_log"
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed = self.limiter.purge_requests_before(cutoff) as u64;
        debug!(removed, %cutoff, "Purged request log");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_purges_request_log() {
        let limiter = Arc::new(RateLimiter::default());
        limiter.record("github", "/events", true, Duration::from_millis(5), HashMap::new());
        limiter.record("github", "/events", false, Duration::from_millis(7), HashMap::new());

        let store = RequestLogRetention::new(Arc::clone(&limiter));

        let removed = store
            .purge_before(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = store
            .purge_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(limiter.usage("github").total_requests, 0);
    }
}
