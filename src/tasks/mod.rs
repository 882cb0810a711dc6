//! Built-in Tasks
//!
//! The recurring work of the garden backend, expressed as [`TaskWork`]
//! units registered on a [`TaskScheduler`].
//!
//! ```text
//!   sync_<source> ──┬──▶ synthesize_mood      (weather sync)
//!                   └──▶ recalculate_growth   (source-control sync)
//!
//!   aggregate_analytics   cache_maintenance   health_check   retention_cleanup
//! ```

mod maintenance;
mod recalc;
mod signals;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::CacheManager;
use crate::domain::ports::{Broadcaster, HealthProbe, Recalculation, RetentionStore, SignalKind, SignalSource};
use crate::error::Result;
use crate::health::HealthState;
use crate::ratelimit::RateLimiter;
use crate::scheduler::{
    Recurrence, SchedulerConfig, TaskDefinition, TaskPriority, TaskScheduler, TaskWork,
};

pub use maintenance::{CacheMaintenance, HealthSweep, RetentionCleanup};
pub use recalc::{AggregateAnalytics, RecalculateGrowth, SynthesizeMood};
pub use signals::SyncSignal;

/// Tag on every cached signal value
pub const SIGNAL_TAG: &str = "signal";

pub const MOOD_KEY: &str = "garden:mood:current";
pub const GROWTH_KEY: &str = "garden:growth:current";
pub const ANALYTICS_KEY: &str = "analytics:summary";

pub const SYNTHESIZE_MOOD: &str = "synthesize_mood";
pub const RECALCULATE_GROWTH: &str = "recalculate_growth";
pub const AGGREGATE_ANALYTICS: &str = "aggregate_analytics";
pub const CACHE_MAINTENANCE: &str = "cache_maintenance";
pub const HEALTH_CHECK: &str = "health_check";
pub const RETENTION_CLEANUP: &str = "retention_cleanup";

/// Scheduler id of a source's refresh task
pub fn signal_task_id(source: &str) -> String {
    format!("sync_{}", source)
}

/// Cache key holding a source's latest value
pub fn signal_cache_key(source: &str) -> String {
    format!("{}:{}:current", SIGNAL_TAG, source)
}

/// Collaborators shared by every built-in task
#[derive(Clone)]
pub struct GardenServices {
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<CacheManager>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub recalculation: Arc<dyn Recalculation>,
    pub health: Arc<HealthState>,
    pub sources: Vec<Arc<dyn SignalSource>>,
    pub probes: Vec<Arc<dyn HealthProbe>>,
    pub retention: Vec<Arc<dyn RetentionStore>>,
}

/// How often each built-in task runs
#[derive(Debug, Clone)]
pub struct CatalogueConfig {
    pub sync_interval: Duration,
    pub mood_interval: Duration,
    pub growth_interval: Duration,
    pub analytics_interval: Duration,
    pub maintenance_interval: Duration,
    pub health_interval: Duration,
    /// Cron expression (with seconds) for the retention sweep
    pub retention_cron: String,
    /// Records older than this are purged
    pub retention_window: Duration,
    /// Longest a sync waits for rate-limit admission
    pub rate_limit_wait: Duration,
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5 * 60),
            mood_interval: Duration::from_secs(10 * 60),
            growth_interval: Duration::from_secs(30 * 60),
            analytics_interval: Duration::from_secs(60 * 60),
            maintenance_interval: Duration::from_secs(10 * 60),
            health_interval: Duration::from_secs(60),
            retention_cron: "0 0 3 * * *".to_string(),
            retention_window: Duration::from_secs(30 * 24 * 60 * 60),
            rate_limit_wait: Duration::from_secs(30),
        }
    }
}

struct Entry {
    definition: TaskDefinition,
    recurrence: Recurrence,
}

fn entry(
    defaults: &SchedulerConfig,
    id: &str,
    name: &str,
    work: Arc<dyn TaskWork>,
    priority: TaskPriority,
    timeout: Duration,
    recurrence: Recurrence,
) -> Entry {
    Entry {
        definition: TaskDefinition::new(id, name, work)
            .priority(priority)
            .timeout(timeout)
            .max_retries(defaults.default_max_retries)
            .retry_delay(defaults.default_retry_delay),
        recurrence,
    }
}

/// Register and schedule every built-in task; returns the task ids
pub fn register_catalogue(
    scheduler: &TaskScheduler,
    services: &GardenServices,
    config: &CatalogueConfig,
) -> Result<Vec<String>> {
    let defaults = scheduler.config();
    let mut entries = Vec::new();

    for source in &services.sources {
        let work = Arc::new(SyncSignal::new(
            Arc::clone(source),
            services.clone(),
            config.rate_limit_wait,
        ));
        let mut e = entry(
            defaults,
            &signal_task_id(source.name()),
            &format!("Refresh {} signal", source.name()),
            work,
            TaskPriority::High,
            Duration::from_secs(60),
            Recurrence::every(config.sync_interval)?,
        );
        e.definition = e
            .definition
            .metadata("service", source.service())
            .metadata("cache_key", signal_cache_key(source.name()));
        entries.push(e);
    }

    let mut mood = entry(
        defaults,
        SYNTHESIZE_MOOD,
        "Synthesize garden mood",
        Arc::new(SynthesizeMood::new(services.clone())),
        TaskPriority::Normal,
        Duration::from_secs(120),
        Recurrence::every(config.mood_interval)?,
    );
    if let Some(weather) = services.sources.iter().find(|s| s.kind() == SignalKind::Weather) {
        mood.definition = mood.definition.depends_on(signal_task_id(weather.name()));
    }
    entries.push(mood);

    let mut growth = entry(
        defaults,
        RECALCULATE_GROWTH,
        "Recalculate plant growth",
        Arc::new(RecalculateGrowth::new(services.clone())),
        TaskPriority::Normal,
        Duration::from_secs(120),
        Recurrence::every(config.growth_interval)?,
    );
    for source in services
        .sources
        .iter()
        .filter(|s| s.kind() == SignalKind::SourceControl)
    {
        growth.definition = growth.definition.depends_on(signal_task_id(source.name()));
    }
    entries.push(growth);

    entries.push(entry(
        defaults,
        AGGREGATE_ANALYTICS,
        "Aggregate analytics",
        Arc::new(AggregateAnalytics::new(services.clone())),
        TaskPriority::Low,
        Duration::from_secs(300),
        Recurrence::every(config.analytics_interval)?,
    ));
    entries.push(entry(
        defaults,
        CACHE_MAINTENANCE,
        "Cache maintenance",
        Arc::new(CacheMaintenance::new(services.clone())),
        TaskPriority::Low,
        Duration::from_secs(60),
        Recurrence::every(config.maintenance_interval)?,
    ));

    let mut health = entry(
        defaults,
        HEALTH_CHECK,
        "Collaborator health sweep",
        Arc::new(HealthSweep::new(services.clone())),
        TaskPriority::Critical,
        Duration::from_secs(30),
        Recurrence::every(config.health_interval)?,
    );
    // A missed sweep is replaced by the next one.
    health.definition = health.definition.max_retries(0);
    entries.push(health);

    entries.push(entry(
        defaults,
        RETENTION_CLEANUP,
        "Retention cleanup",
        Arc::new(RetentionCleanup::new(services.clone(), config.retention_window)),
        TaskPriority::Low,
        Duration::from_secs(600),
        Recurrence::cron(&config.retention_cron)?,
    ));

    let mut ids = Vec::with_capacity(entries.len());
    for Entry { definition, recurrence } in entries {
        let id = definition.id.clone();
        scheduler.register(definition);
        scheduler.schedule(&id, recurrence, 1)?;
        ids.push(id);
    }

    info!(tasks = ids.len(), "Registered built-in tasks");
    Ok(ids)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::adapters::{InMemoryEventCollector, RequestLogRetention, SignalSummaryRecalculation};
    use crate::cache::{CacheConfig, InMemoryNetworkStore};
    use crate::error::Error;
    use crate::health::{HealthCheckResult, HealthStatus};
    use crate::ratelimit::{RateLimitConfig, RateLimiterConfig};
    use crate::scheduler::{TaskContext, TaskStatus};

    struct FakeSource {
        name: &'static str,
        kind: SignalKind,
        value: Option<Value>,
    }

    #[async_trait]
    impl SignalSource for FakeSource {
        fn name(&self) -> &str {
            self.name
        }

        fn service(&self) -> &str {
            self.name
        }

        fn kind(&self) -> SignalKind {
            self.kind
        }

        async fn fetch(&self) -> Result<Value> {
            self.value.clone().ok_or_else(|| Error::SignalUnavailable {
                name: self.name.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    struct FixedProbe(HealthStatus);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn check(&self) -> HealthCheckResult {
            match self.0 {
                HealthStatus::Healthy => HealthCheckResult::healthy("fixed"),
                HealthStatus::Degraded => HealthCheckResult::degraded("fixed", "slow"),
                HealthStatus::Unhealthy => HealthCheckResult::unhealthy("fixed", "down"),
            }
        }
    }

    struct Fixture {
        services: GardenServices,
        events: Arc<InMemoryEventCollector>,
        network: Arc<InMemoryNetworkStore>,
    }

    fn fixture(sources: Vec<Arc<dyn SignalSource>>) -> Fixture {
        let limiter = Arc::new(RateLimiter::default());
        let network = Arc::new(InMemoryNetworkStore::new());
        let cache = Arc::new(CacheManager::with_network(
            CacheConfig::default(),
            Arc::clone(&network) as _,
        ));
        let events = Arc::new(InMemoryEventCollector::new());

        let services = GardenServices {
            limiter: Arc::clone(&limiter),
            cache,
            broadcaster: Arc::clone(&events) as _,
            recalculation: Arc::new(SignalSummaryRecalculation::new()),
            health: Arc::new(HealthState::new()),
            sources,
            probes: vec![Arc::new(FixedProbe(HealthStatus::Healthy))],
            retention: vec![Arc::new(RequestLogRetention::new(limiter))],
        };
        Fixture {
            services,
            events,
            network,
        }
    }

    fn weather(value: Option<Value>) -> Arc<dyn SignalSource> {
        Arc::new(FakeSource {
            name: "weather",
            kind: SignalKind::Weather,
            value,
        })
    }

    fn github() -> Arc<dyn SignalSource> {
        Arc::new(FakeSource {
            name: "github",
            kind: SignalKind::SourceControl,
            value: Some(json!({"commits": 3})),
        })
    }

    fn ctx(task_id: &str) -> TaskContext {
        TaskContext::new(Uuid::new_v4(), task_id, 0, HashMap::new(), CancellationToken::new())
    }

    #[test]
    fn test_naming() {
        assert_eq!(signal_task_id("weather"), "sync_weather");
        assert_eq!(signal_cache_key("weather"), "signal:weather:current");
    }

    #[tokio::test]
    async fn test_sync_caches_and_broadcasts() {
        let f = fixture(vec![weather(Some(json!({"temp_c": 19})))]);
        let task = SyncSignal::new(
            Arc::clone(&f.services.sources[0]),
            f.services.clone(),
            Duration::from_secs(1),
        );

        let result = task.execute(ctx("sync_weather")).await.unwrap();
        assert_eq!(result["cache_key"], "signal:weather:current");

        let cached: Value = f
            .services
            .cache
            .get_json("signal:weather:current")
            .await
            .unwrap();
        assert_eq!(cached["temp_c"], 19);
        assert_eq!(f.network.len(), 1);
        assert_eq!(f.events.events_of_type("SignalUpdated").len(), 1);
        assert_eq!(f.services.limiter.usage("weather").total_requests, 1);
    }

    #[tokio::test]
    async fn test_sync_failure_broadcasts() {
        let f = fixture(vec![weather(None)]);
        let task = SyncSignal::new(
            Arc::clone(&f.services.sources[0]),
            f.services.clone(),
            Duration::from_secs(1),
        );

        assert!(task.execute(ctx("sync_weather")).await.is_err());
        assert_eq!(f.events.events_of_type("SignalFailed").len(), 1);
        assert_eq!(f.services.limiter.usage("weather").failed_requests, 1);
    }

    #[tokio::test]
    async fn test_sync_respects_rate_limit() {
        let mut config = RateLimiterConfig::default();
        config.services.insert(
            "weather".to_string(),
            RateLimitConfig {
                requests_per_minute: 1,
                burst_limit: 1,
                enabled: true,
            },
        );
        let mut f = fixture(vec![weather(Some(json!({})))]);
        f.services.limiter = Arc::new(RateLimiter::new(config));
        assert!(f.services.limiter.check("weather", 1).is_allowed());

        let task = SyncSignal::new(
            Arc::clone(&f.services.sources[0]),
            f.services.clone(),
            Duration::ZERO,
        );
        let err = task.execute(ctx("sync_weather")).await.unwrap_err();
        assert!(err.to_string().contains("Rate limit exceeded"));
        assert_eq!(f.events.events_of_type("SignalFailed").len(), 1);
    }

    #[tokio::test]
    async fn test_mood_and_growth_read_cached_signals() {
        let f = fixture(vec![weather(Some(json!({"temp_c": 12}))), github()]);
        for source in &f.services.sources {
            SyncSignal::new(Arc::clone(source), f.services.clone(), Duration::from_secs(1))
                .execute(ctx("sync"))
                .await
                .unwrap();
        }

        let mood = SynthesizeMood::new(f.services.clone())
            .execute(ctx(SYNTHESIZE_MOOD))
            .await
            .unwrap();
        assert_eq!(mood["signal_count"], 2);

        let growth = RecalculateGrowth::new(f.services.clone())
            .execute(ctx(RECALCULATE_GROWTH))
            .await
            .unwrap();
        assert_eq!(growth["total"], 3.0);

        assert!(f.services.cache.get(MOOD_KEY).await.is_some());
        assert!(f.services.cache.get(GROWTH_KEY).await.is_some());
        assert_eq!(f.events.events_of_type("MoodSynthesized").len(), 1);
        assert_eq!(f.events.events_of_type("GrowthRecalculated").len(), 1);
    }

    #[tokio::test]
    async fn test_health_sweep_reports_network_outage() {
        let f = fixture(Vec::new());
        f.network.set_available(false);

        let report = HealthSweep::new(f.services.clone())
            .execute(ctx(HEALTH_CHECK))
            .await
            .unwrap();
        assert_eq!(report["status"], "unhealthy");

        let recorded = f.services.health.last_report().unwrap();
        assert_eq!(recorded.unhealthy(), vec!["network_cache"]);
        assert_eq!(f.events.events_of_type("HealthReported").len(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_and_retention() {
        let f = fixture(Vec::new());
        f.services
            .limiter
            .record("github", "/events", true, Duration::from_millis(1), HashMap::new());

        let result = CacheMaintenance::new(f.services.clone())
            .execute(ctx(CACHE_MAINTENANCE))
            .await
            .unwrap();
        assert_eq!(result["purged"], 0);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // A zero window purges everything recorded so far.
        let result = RetentionCleanup::new(f.services.clone(), Duration::ZERO)
            .execute(ctx(RETENTION_CLEANUP))
            .await
            .unwrap();
        assert_eq!(result["removed"], 1);
        assert_eq!(f.events.events_of_type("RetentionApplied").len(), 1);
    }

    #[tokio::test]
    async fn test_register_catalogue_wires_dependencies() {
        let f = fixture(vec![weather(Some(json!({}))), github()]);
        let scheduler = TaskScheduler::new(SchedulerConfig::default());

        let ids = register_catalogue(&scheduler, &f.services, &CatalogueConfig::default()).unwrap();
        assert_eq!(ids.len(), 8);
        assert!(ids.contains(&"sync_weather".to_string()));
        assert!(ids.contains(&"sync_github".to_string()));
        scheduler.validate().unwrap();
        assert_eq!(scheduler.schedules().len(), 8);

        // Mood waits for a completed weather sync.
        let report = scheduler.tick();
        assert!(report.waiting_on_dependencies.contains(&SYNTHESIZE_MOOD.to_string()));
        assert!(report.waiting_on_dependencies.contains(&RECALCULATE_GROWTH.to_string()));
        let (_, sync_id) = report
            .dispatched
            .iter()
            .find(|(id, _)| id == "sync_weather")
            .cloned()
            .unwrap();

        for _ in 0..200 {
            if scheduler.status(sync_id).map(|e| e.status) == Some(TaskStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            scheduler.status(sync_id).map(|e| e.status),
            Some(TaskStatus::Completed)
        );

        let mood = scheduler.run_now(SYNTHESIZE_MOOD, HashMap::new()).unwrap();
        assert!(mood.is_some());

        scheduler.stop().await;
    }

    #[test]
    fn test_invalid_retention_cron_is_rejected() {
        let f = fixture(Vec::new());
        let scheduler = TaskScheduler::new(SchedulerConfig::default());
        let config = CatalogueConfig {
            retention_cron: "not a cron".to_string(),
            ..CatalogueConfig::default()
        };

        let err = register_catalogue(&scheduler, &f.services, &config).unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule { .. }));
    }
}
