//! Garden Events
//!
//! Immutable records of things the background tasks changed. Task bodies
//! hand them to a [`Broadcaster`](super::ports::Broadcaster) so live clients
//! can refresh; nothing in the core waits on delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Something noteworthy happened in the garden backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GardenEvent {
    // =========================================================================
    // Signal Events
    // =========================================================================
    /// An external signal was refreshed.
    SignalUpdated {
        source: String,
        cache_key: String,
        timestamp: DateTime<Utc>,
    },

    /// An external signal could not be refreshed.
    SignalFailed {
        source: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Recalculation Events
    // =========================================================================
    /// A new mood/atmosphere was synthesized from the signals.
    MoodSynthesized {
        mood: Value,
        timestamp: DateTime<Utc>,
    },

    /// Plant growth metrics were recalculated.
    GrowthRecalculated {
        growth: Value,
        timestamp: DateTime<Utc>,
    },

    /// Analytics were aggregated.
    AnalyticsAggregated {
        summary: Value,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Maintenance Events
    // =========================================================================
    /// Expired cache entries were swept.
    CacheMaintained {
        purged: usize,
        timestamp: DateTime<Utc>,
    },

    /// A health sweep finished.
    HealthReported {
        status: String,
        unhealthy: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Old records were removed.
    RetentionApplied {
        removed: u64,
        cutoff: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl GardenEvent {
    /// Event name used in logs and as the broadcast channel topic.
    pub fn event_type(&self) -> &'static str {
        match self {
            GardenEvent::SignalUpdated { .. } => "SignalUpdated",
            GardenEvent::SignalFailed { .. } => "SignalFailed",
            GardenEvent::MoodSynthesized { .. } => "MoodSynthesized",
            GardenEvent::GrowthRecalculated { .. } => "GrowthRecalculated",
            GardenEvent::AnalyticsAggregated { .. } => "AnalyticsAggregated",
            GardenEvent::CacheMaintained { .. } => "CacheMaintained",
            GardenEvent::HealthReported { .. } => "HealthReported",
            GardenEvent::RetentionApplied { .. } => "RetentionApplied",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            GardenEvent::SignalUpdated { timestamp, .. }
            | GardenEvent::SignalFailed { timestamp, .. }
            | GardenEvent::MoodSynthesized { timestamp, .. }
            | GardenEvent::GrowthRecalculated { timestamp, .. }
            | GardenEvent::AnalyticsAggregated { timestamp, .. }
            | GardenEvent::CacheMaintained { timestamp, .. }
            | GardenEvent::HealthReported { timestamp, .. }
            | GardenEvent::RetentionApplied { timestamp, .. } => *timestamp,
        }
    }

    pub fn signal_updated(source: impl Into<String>, cache_key: impl Into<String>) -> Self {
        GardenEvent::SignalUpdated {
            source: source.into(),
            cache_key: cache_key.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn signal_failed(source: impl Into<String>, error: impl Into<String>) -> Self {
        GardenEvent::SignalFailed {
            source: source.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tag() {
        let event = GardenEvent::signal_updated("weather", "signal:weather:current");
        assert_eq!(event.event_type(), "SignalUpdated");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SignalUpdated");
        assert_eq!(json["source"], "weather");

        let back: GardenEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_timestamp_accessor() {
        let event = GardenEvent::CacheMaintained {
            purged: 3,
            timestamp: Utc::now(),
        };
        assert!(event.timestamp() <= Utc::now());
    }
}
