//! Prometheus Metrics
//!
//! Process-wide collectors registered on the default registry and exposed by
//! the binary's `/metrics` endpoint. Registration failures disable recording
//! instead of aborting the process.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

use crate::cache::CacheTier;
use crate::error::{Error, Result};

struct Metrics {
    rate_limit_decisions: IntCounterVec,
    cache_lookups: IntCounterVec,
    task_executions: IntCounterVec,
    task_duration: HistogramVec,
    running_tasks: IntGauge,
    scheduler_ticks: IntCounter,
}

impl Metrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let rate_limit_decisions = IntCounterVec::new(
            Opts::new(
                "plantfolio_rate_limit_decisions_total",
                "Rate limit admission decisions",
            ),
            &["service", "outcome"],
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("plantfolio_cache_lookups_total", "Cache lookups per tier"),
            &["tier", "result"],
        )?;
        let task_executions = IntCounterVec::new(
            Opts::new(
                "plantfolio_task_executions_total",
                "Finished task executions",
            ),
            &["task", "status"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "plantfolio_task_duration_seconds",
                "Task execution wall time",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["task"],
        )?;
        let running_tasks = IntGauge::new(
            "plantfolio_running_tasks",
            "Executions currently in flight",
        )?;
        let scheduler_ticks = IntCounter::new(
            "plantfolio_scheduler_ticks_total",
            "Scheduler loop evaluations",
        )?;

        registry.register(Box::new(rate_limit_decisions.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(task_executions.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(running_tasks.clone()))?;
        registry.register(Box::new(scheduler_ticks.clone()))?;

        Ok(Self {
            rate_limit_decisions,
            cache_lookups,
            task_executions,
            task_duration,
            running_tasks,
            scheduler_ticks,
        })
    }
}

static METRICS: Lazy<Option<Metrics>> =
    Lazy::new(|| match Metrics::register(prometheus::default_registry()) {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(error = %e, "Metrics registration failed, recording disabled");
            None
        }
    });

/// Force registration so `/metrics` lists every family from the start
pub fn init() {
    Lazy::force(&METRICS);
}

pub fn record_rate_limit_decision(service: &str, allowed: bool) {
    if let Some(m) = METRICS.as_ref() {
        let outcome = if allowed { "allowed" } else { "denied" };
        m.rate_limit_decisions
            .with_label_values(&[service, outcome])
            .inc();
    }
}

pub fn record_cache_lookup(tier: CacheTier, hit: bool) {
    if let Some(m) = METRICS.as_ref() {
        let tier = match tier {
            CacheTier::Memory => "memory",
            CacheTier::Network => "network",
        };
        let result = if hit { "hit" } else { "miss" };
        m.cache_lookups.with_label_values(&[tier, result]).inc();
    }
}

/// Record a terminal execution
pub fn record_task_finished(task: &str, status: &str, duration: Option<Duration>) {
    if let Some(m) = METRICS.as_ref() {
        m.task_executions.with_label_values(&[task, status]).inc();
        if let Some(duration) = duration {
            m.task_duration
                .with_label_values(&[task])
                .observe(duration.as_secs_f64());
        }
    }
}

pub fn set_running_tasks(count: usize) {
    if let Some(m) = METRICS.as_ref() {
        m.running_tasks.set(count as i64);
    }
}

pub fn record_scheduler_tick() {
    if let Some(m) = METRICS.as_ref() {
        m.scheduler_ticks.inc();
    }
}

/// Text exposition of the default registry
pub fn encode() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Metrics encoding failed: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_families_are_exposed() {
        init();
        record_rate_limit_decision("github", true);
        record_cache_lookup(CacheTier::Memory, false);
        record_task_finished("health_check", "completed", Some(Duration::from_millis(5)));
        record_scheduler_tick();

        let (content_type, body) = encode().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("plantfolio_rate_limit_decisions_total"));
        assert!(body.contains("plantfolio_cache_lookups_total"));
        assert!(body.contains("plantfolio_task_duration_seconds"));
        assert!(body.contains("plantfolio_scheduler_ticks_total"));
    }
}
