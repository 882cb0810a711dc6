//! Derived-data tasks: mood, growth and analytics

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    signal_cache_key, GardenServices, ANALYTICS_KEY, GROWTH_KEY, MOOD_KEY,
};
use crate::cache::SetOptions;
use crate::domain::events::GardenEvent;
use crate::domain::ports::{SignalKind, SignalSource};
use crate::scheduler::{TaskContext, TaskWork};

/// Latest cached value of every source, keyed by source name
async fn cached_signals(
    services: &GardenServices,
    sources: &[Arc<dyn SignalSource>],
) -> HashMap<String, Value> {
    let mut signals = HashMap::new();
    for source in sources {
        match services
            .cache
            .get_json::<Value>(&signal_cache_key(source.name()))
            .await
        {
            Some(value) => {
                signals.insert(source.name().to_string(), value);
            }
            None => debug!(signal = source.name(), "No cached value for signal"),
        }
    }
    signals
}

// =============================================================================
// Mood
// =============================================================================

/// Synthesizes the garden mood from every cached signal.
pub struct SynthesizeMood {
    services: GardenServices,
}

impl SynthesizeMood {
    pub fn new(services: GardenServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TaskWork for SynthesizeMood {
    async fn execute(&self, _ctx: TaskContext) -> anyhow::Result<Value> {
        let signals = cached_signals(&self.services, &self.services.sources).await;
        let mood = self.services.recalculation.synthesize_mood(&signals).await?;

        self.services
            .cache
            .set_json(MOOD_KEY, &mood, SetOptions::new().tag("mood"))
            .await?;
        self.services
            .broadcaster
            .broadcast(GardenEvent::MoodSynthesized {
                mood: mood.clone(),
                timestamp: Utc::now(),
            })
            .await;

        info!(signals = signals.len(), "Mood synthesized");
        Ok(mood)
    }
}

// =============================================================================
// Growth
// =============================================================================

/// Recomputes growth from source-control activity.
pub struct RecalculateGrowth {
    services: GardenServices,
}

impl RecalculateGrowth {
    pub fn new(services: GardenServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TaskWork for RecalculateGrowth {
    async fn execute(&self, _ctx: TaskContext) -> anyhow::Result<Value> {
        let sources: Vec<Arc<dyn SignalSource>> = self
            .services
            .sources
            .iter()
            .filter(|s| s.kind() == SignalKind::SourceControl)
            .cloned()
            .collect();
        let activity = cached_signals(&self.services, &sources).await;
        let growth = self.services.recalculation.recalculate_growth(&activity).await?;

        self.services
            .cache
            .set_json(GROWTH_KEY, &growth, SetOptions::new().tag("growth"))
            .await?;
        self.services
            .broadcaster
            .broadcast(GardenEvent::GrowthRecalculated {
                growth: growth.clone(),
                timestamp: Utc::now(),
            })
            .await;

        info!(sources = activity.len(), "Growth recalculated");
        Ok(growth)
    }
}

// =============================================================================
// Analytics
// =============================================================================

/// Rolls outbound usage and cache figures into an analytics summary.
pub struct AggregateAnalytics {
    services: GardenServices,
}

impl AggregateAnalytics {
    pub fn new(services: GardenServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TaskWork for AggregateAnalytics {
    async fn execute(&self, _ctx: TaskContext) -> anyhow::Result<Value> {
        let snapshot = json!({
            "usage": self.services.limiter.all_usage(),
            "cache": self.services.cache.stats(),
        });
        let summary = self.services.recalculation.aggregate_analytics(snapshot).await?;

        self.services
            .cache
            .set_json(ANALYTICS_KEY, &summary, SetOptions::new().tag("analytics"))
            .await?;
        self.services
            .broadcaster
            .broadcast(GardenEvent::AnalyticsAggregated {
                summary: summary.clone(),
                timestamp: Utc::now(),
            })
            .await;

        Ok(summary)
    }
}
