//! Housekeeping tasks: cache sweep, health sweep and retention

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::GardenServices;
use crate::domain::events::GardenEvent;
use crate::health::{HealthCheckResult, HealthReport};
use crate::scheduler::{TaskContext, TaskWork};

// =============================================================================
// Cache Maintenance
// =============================================================================

/// Sweeps expired entries out of the memory tier.
pub struct CacheMaintenance {
    services: GardenServices,
}

impl CacheMaintenance {
    pub fn new(services: GardenServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TaskWork for CacheMaintenance {
    async fn execute(&self, _ctx: TaskContext) -> anyhow::Result<Value> {
        let purged = self.services.cache.purge_expired();
        let stats = self.services.cache.stats();

        self.services
            .broadcaster
            .broadcast(GardenEvent::CacheMaintained {
                purged,
                timestamp: Utc::now(),
            })
            .await;

        Ok(json!({
            "purged": purged,
            "entries": stats.memory.entries,
            "size_bytes": stats.memory.size_bytes,
        }))
    }
}

// =============================================================================
// Health Sweep
// =============================================================================

/// Probes every collaborator plus the network cache tier.
pub struct HealthSweep {
    services: GardenServices,
}

impl HealthSweep {
    pub fn new(services: GardenServices) -> Self {
        Self { services }
    }

    async fn check_network_cache(&self) -> Option<HealthCheckResult> {
        self.services.cache.network()?;

        let started = Instant::now();
        let result = if self.services.cache.ping().await {
            HealthCheckResult::healthy("network_cache")
        } else {
            HealthCheckResult::unhealthy("network_cache", "network cache tier unreachable")
        };
        Some(result.with_latency(started.elapsed()))
    }
}

#[async_trait]
impl TaskWork for HealthSweep {
    async fn execute(&self, _ctx: TaskContext) -> anyhow::Result<Value> {
        let mut checks = join_all(self.services.probes.iter().map(|probe| probe.check())).await;
        if let Some(cache) = self.check_network_cache().await {
            checks.push(cache);
        }

        let report = HealthReport::new(checks, self.services.health.uptime());
        let unhealthy = report.unhealthy();
        if unhealthy.is_empty() {
            info!(status = %report.status, checks = report.checks.len(), "Health sweep finished");
        } else {
            warn!(status = %report.status, ?unhealthy, "Health sweep found unhealthy collaborators");
        }

        self.services.health.record(report.clone());
        self.services
            .broadcaster
            .broadcast(GardenEvent::HealthReported {
                status: report.status.to_string(),
                unhealthy,
                timestamp: Utc::now(),
            })
            .await;

        Ok(serde_json::to_value(report)?)
    }
}

// =============================================================================
// Retention
// =============================================================================

/// Purges records older than the retention window from every store.
pub struct RetentionCleanup {
    services: GardenServices,
    window: Duration,
}

impl RetentionCleanup {
    pub fn new(services: GardenServices, window: Duration) -> Self {
        Self { services, window }
    }
}

#[async_trait]
impl TaskWork for RetentionCleanup {
    async fn execute(&self, _ctx: TaskContext) -> anyhow::Result<Value> {
        let window = chrono::Duration::from_std(self.window)?;
        let cutoff = Utc::now() - window;

        let mut removed = 0u64;
        let mut failed = Vec::new();
        for store in &self.services.retention {
            match store.purge_before(cutoff).await {
                Ok(count) => removed += count,
                Err(e) => {
                    warn!(store = store.name(), error = %e, "Retention purge failed");
                    failed.push(store.name().to_string());
                }
            }
        }

        self.services
            .broadcaster
            .broadcast(GardenEvent::RetentionApplied {
                removed,
                cutoff,
                timestamp: Utc::now(),
            })
            .await;

        if !failed.is_empty() && failed.len() == self.services.retention.len() {
            anyhow::bail!("every retention store failed: {}", failed.join(", "));
        }

        info!(removed, %cutoff, "Retention applied");
        Ok(json!({
            "removed": removed,
            "cutoff": cutoff,
            "failed": failed,
        }))
    }
}
