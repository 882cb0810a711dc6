//! Health Reporting
//!
//! Results of collaborator probes, the aggregated report produced by the
//! `health_check` task, and the readiness state served on `/readyz`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully working
    Healthy,
    /// Working with reduced capability
    Degraded,
    /// Not working
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            latency_ms: 0,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }
}

/// Aggregate of every probe in one sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst individual status
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
            generated_at: Utc::now(),
        }
    }

    /// Names of probes that are not operational
    pub fn unhealthy(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.status.is_operational())
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Process health shared between the health task and the HTTP probes
pub struct HealthState {
    started: Instant,
    ready: AtomicBool,
    last_report: RwLock<Option<HealthReport>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ready: AtomicBool::new(false),
            last_report: RwLock::new(None),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Ready once startup finished and the last sweep was operational
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
            && self
                .last_report
                .read()
                .as_ref()
                .map_or(true, |r| r.status.is_operational())
    }

    pub fn record(&self, report: HealthReport) {
        *self.last_report.write() = Some(report);
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().clone()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
