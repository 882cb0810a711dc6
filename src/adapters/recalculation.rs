//! Recalculation Adapter
//!
//! A domain-neutral `Recalculation` that summarises whatever the signal
//! sources returned. Deployments with real scoring plug in their own.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::domain::ports::Recalculation;
use crate::error::Result;

/// Summarises signal payloads without domain knowledge.
#[derive(Debug, Clone, Default)]
pub struct SignalSummaryRecalculation;

impl SignalSummaryRecalculation {
    pub fn new() -> Self {
        Self
    }
}

/// Sum of the top-level numeric fields of a JSON object
fn numeric_total(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Object(fields) => fields.values().filter_map(Value::as_f64).sum(),
        _ => 0.0,
    }
}

#[async_trait]
impl Recalculation for SignalSummaryRecalculation {
    async fn synthesize_mood(&self, signals: &HashMap<String, Value>) -> Result<Value> {
        // BTreeMap keeps the output stable across runs
        let ordered: BTreeMap<&String, &Value> = signals.iter().collect();
        let inputs: Map<String, Value> = ordered
            .into_iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(json!({
            "signal_count": signals.len(),
            "inputs": inputs,
            "synthesized_at": Utc::now(),
        }))
    }

    async fn recalculate_growth(&self, activity: &HashMap<String, Value>) -> Result<Value> {
        let per_source: BTreeMap<&String, f64> = activity
            .iter()
            .map(|(name, value)| (name, numeric_total(value)))
            .collect();
        let total: f64 = per_source.values().sum();

        Ok(json!({
            "activity": per_source,
            "total": total,
            "calculated_at": Utc::now(),
        }))
    }

    async fn aggregate_analytics(&self, snapshot: Value) -> Result<Value> {
        Ok(json!({
            "snapshot": snapshot,
            "aggregated_at": Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mood_lists_inputs() {
        let mut signals = HashMap::new();
        signals.insert("weather".to_string(), json!({"temp_c": 18}));
        signals.insert("music".to_string(), json!({"track": "x"}));

        let mood = SignalSummaryRecalculation::new()
            .synthesize_mood(&signals)
            .await
            .unwrap();
        assert_eq!(mood["signal_count"], 2);
        assert_eq!(mood["inputs"]["weather"]["temp_c"], 18);
    }

    #[tokio::test]
    async fn test_growth_sums_numeric_fields() {
        let mut activity = HashMap::new();
        activity.insert(
            "github".to_string(),
            json!({"commits": 4, "pull_requests": 1, "login": "gardener"}),
        );
        activity.insert("gitlab".to_string(), json!(2));

        let growth = SignalSummaryRecalculation::new()
            .recalculate_growth(&activity)
            .await
            .unwrap();
        assert_eq!(growth["activity"]["github"], 5.0);
        assert_eq!(growth["total"], 7.0);
    }
}
