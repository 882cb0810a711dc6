//! Signal refresh tasks

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::{signal_cache_key, GardenServices, SIGNAL_TAG};
use crate::cache::SetOptions;
use crate::domain::events::GardenEvent;
use crate::domain::ports::SignalSource;
use crate::error::Error;
use crate::scheduler::{TaskContext, TaskWork};

/// Fetches one signal under its rate limit and caches the result.
pub struct SyncSignal {
    source: Arc<dyn SignalSource>,
    services: GardenServices,
    max_wait: Duration,
}

impl SyncSignal {
    pub fn new(source: Arc<dyn SignalSource>, services: GardenServices, max_wait: Duration) -> Self {
        Self {
            source,
            services,
            max_wait,
        }
    }

    async fn fail(&self, error: &str) {
        self.services
            .broadcaster
            .broadcast(GardenEvent::signal_failed(self.source.name(), error))
            .await;
    }
}

#[async_trait]
impl TaskWork for SyncSignal {
    #[instrument(skip(self, ctx), fields(signal = %self.source.name(), attempt = ctx.attempt))]
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        let name = self.source.name();
        let service = self.source.service();

        if !self.services.limiter.wait(service, self.max_wait).await {
            let err = Error::RateLimitExceeded {
                service: service.to_string(),
            };
            self.fail(&err.to_string()).await;
            return Err(err.into());
        }

        let started = Instant::now();
        let fetched = self.source.fetch().await;
        let latency = started.elapsed();

        let value = match fetched {
            Ok(value) => {
                self.services
                    .limiter
                    .record(service, name, true, latency, HashMap::new());
                value
            }
            Err(e) => {
                let mut metadata = HashMap::new();
                metadata.insert("error".to_string(), e.to_string());
                self.services
                    .limiter
                    .record(service, name, false, latency, metadata);
                warn!(signal = name, error = %e, "Signal fetch failed");
                self.fail(&e.to_string()).await;
                return Err(e.into());
            }
        };

        let key = signal_cache_key(name);
        let options = SetOptions::new()
            .tag(SIGNAL_TAG)
            .tag(format!("{}:{}", SIGNAL_TAG, name));
        let stored = self.services.cache.set_json(&key, &value, options).await?;
        if !stored {
            warn!(signal = name, key, "Signal value was not cached");
        }

        self.services
            .broadcaster
            .broadcast(GardenEvent::signal_updated(name, key.clone()))
            .await;
        info!(signal = name, ?latency, "Signal refreshed");

        Ok(json!({
            "source": name,
            "cache_key": key,
            "cached": stored,
            "latency_ms": latency.as_millis() as u64,
        }))
    }
}
