//! Screening ranking and alert conversion.

use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;

use crate::engine::modes::Instance;

fn score_of(instance: &Instance) -> Option<f64> {
    instance.get("score").and_then(Value::as_f64)
}

fn timestamp_of(instance: &Instance) -> i64 {
    instance.get("timestamp").and_then(Value::as_i64).unwrap_or(0)
}

/// Sort instances by `score` descending if every instance has one,
/// otherwise by `timestamp` descending.
pub fn sort_for_screening(mut instances: Vec<Instance>) -> Vec<Instance> {
    let has_scores = !instances.is_empty() && instances.iter().all(|i| score_of(i).is_some());
    if has_scores {
        instances.sort_by(|a, b| score_of(b).unwrap().total_cmp(&score_of(a).unwrap()));
    } else {
        instances.sort_by_key(|b| std::cmp::Reverse(timestamp_of(b)));
    }
    instances
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct RankedResult {
    pub symbol: String,
    pub score: Option<f64>,
    pub current_price: Option<f64>,
    pub sector: Option<String>,
    pub data: Instance,
}

fn current_price_of(instance: &Instance) -> Option<f64> {
    instance
        .get("entry_price")
        .or_else(|| instance.get("close"))
        .or_else(|| instance.get("price"))
        .and_then(Value::as_f64)
}

/// Rank and truncate to `limit`.
pub fn rank_for_screening(instances: Vec<Instance>, limit: usize) -> Vec<RankedResult> {
    sort_for_screening(instances)
        .into_iter()
        .take(limit)
        .map(|instance| RankedResult {
            symbol: instance.get("ticker").and_then(Value::as_str).unwrap_or_default().to_string(),
            score: score_of(&instance),
            current_price: current_price_of(&instance),
            sector: instance.get("sector").and_then(Value::as_str).map(str::to_string),
            data: instance,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    High,
    Medium,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct AlertRecord {
    pub symbol: String,
    #[serde(rename = "type")]
    pub alert_type: &'static str,
    pub message: String,
    pub timestamp: i64,
    pub data: Instance,
    pub priority: AlertPriority,
}

/// `>0.8` (on `score` or `signal_strength`) is `high`, else `medium`.
fn priority_of(instance: &Instance) -> AlertPriority {
    let strong = score_of(instance)
        .or_else(|| instance.get("signal_strength").and_then(Value::as_f64))
        .is_some_and(|v| v > 0.8);
    if strong {
        AlertPriority::High
    } else {
        AlertPriority::Medium
    }
}

/// Convert one instance into an alert record.
pub fn to_alert(instance: Instance, now: i64) -> AlertRecord {
    let symbol = instance.get("ticker").and_then(Value::as_str).unwrap_or_default().to_string();
    let priority = priority_of(&instance);
    AlertRecord {
        message: format!("{symbol} triggered a strategy signal"),
        symbol,
        alert_type: "strategy_signal",
        timestamp: now,
        data: instance,
        priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(fields: Value) -> Instance {
        match fields {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn screening_ranks_by_score_descending_and_truncates() {
        let instances = vec![
            instance(json!({"ticker": "A", "score": 0.2, "entry_price": 10})),
            instance(json!({"ticker": "B", "score": 0.9, "entry_price": 20})),
            instance(json!({"ticker": "C", "score": 0.5, "entry_price": 30})),
        ];
        let ranked = rank_for_screening(instances, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].symbol, "B");
        assert_eq!(ranked[0].current_price, Some(20.0));
        assert_eq!(ranked[1].symbol, "C");
    }

    #[test]
    fn screening_falls_back_to_timestamp_when_score_missing() {
        let instances = vec![
            instance(json!({"ticker": "A", "timestamp": 1})),
            instance(json!({"ticker": "B", "timestamp": 3})),
            instance(json!({"ticker": "C", "timestamp": 2})),
        ];
        let ranked = rank_for_screening(instances, 3);
        assert_eq!(
            ranked.iter().map(|r| r.symbol.clone()).collect::<Vec<_>>(),
            vec!["B", "C", "A"]
        );
    }

    #[test]
    fn alert_priority_high_above_point_eight() {
        let a = to_alert(instance(json!({"ticker": "X", "score": 0.85})), 0);
        assert_eq!(a.priority, AlertPriority::High);

        let b = to_alert(instance(json!({"ticker": "Y", "score": 0.6})), 0);
        assert_eq!(b.priority, AlertPriority::Medium);
    }

    #[test]
    fn alert_priority_considers_signal_strength_when_score_absent() {
        let a = to_alert(instance(json!({"ticker": "X", "signal_strength": 0.95})), 0);
        assert_eq!(a.priority, AlertPriority::High);
    }
}
