//! Domain Ports
//!
//! The collaborators the built-in tasks call outward. Adapters in
//! [`crate::adapters`] implement them; tests swap in fakes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Built-in Tasks                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                   Ports (Traits)                     │    │
//! │  │  SignalSource │ HealthProbe │ Broadcaster │ ...      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters                              │
//! │  HttpSignalSource │ HttpHealthProbe │ ChannelBroadcaster     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::events::GardenEvent;
use crate::error::Result;
use crate::health::HealthCheckResult;

/// What kind of data a signal carries; decides which recalculations use it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Weather,
    Music,
    SourceControl,
    TimeTracking,
    Other,
}

/// An external data feed
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Short name, used in task ids and cache keys
    fn name(&self) -> &str;

    /// Rate limiter service the fetch is charged to
    fn service(&self) -> &str;

    fn kind(&self) -> SignalKind;

    /// Fetch the current value
    async fn fetch(&self) -> Result<Value>;
}

/// Health check for one external collaborator
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Never fails; problems are reported in the result
    async fn check(&self) -> HealthCheckResult;
}

/// Fire-and-forget notification sink
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, event: GardenEvent);
}

#[async_trait]
impl<T: Broadcaster + ?Sized> Broadcaster for std::sync::Arc<T> {
    async fn broadcast(&self, event: GardenEvent) {
        (**self).broadcast(event).await
    }
}

/// Domain scoring hooks run by the recalculation tasks
#[async_trait]
pub trait Recalculation: Send + Sync {
    /// Derive the garden's mood from the latest signal values
    async fn synthesize_mood(&self, signals: &HashMap<String, Value>) -> Result<Value>;

    /// Recompute growth metrics from source-control activity
    async fn recalculate_growth(&self, activity: &HashMap<String, Value>) -> Result<Value>;

    /// Roll operational figures up into an analytics summary
    async fn aggregate_analytics(&self, snapshot: Value) -> Result<Value>;
}

/// Storage with a retention policy
#[async_trait]
pub trait RetentionStore: Send + Sync {
    fn name(&self) -> &str;

    /// Delete records older than `cutoff`, returning how many went
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
