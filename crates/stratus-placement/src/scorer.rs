//! Score plugins: turn a node's self-reported stats into a placement score.
//!
//! Lower scores are preferred. A score is only ever computed from the
//! node's own latest stats, so nodes never need to agree on anything
//! beyond the plugin in use.

use std::collections::BTreeMap;

use serde_json::Value;

use stratus_state::StatsMap;

use crate::error::{PluginError, PluginResult};

/// Score contract: `score(stats) -> f64 >= 0`, lower is better.
pub trait ScorePlugin: Send + Sync {
    fn id(&self) -> &str;

    fn score(&self, stats: &StatsMap) -> f64;
}

/// Clamp a raw plugin score into the valid range.
///
/// Negative, NaN and infinite values become `f64::MAX`, the worst finite
/// score. Returns the clamped score and whether clamping happened.
pub fn sanitize_score(raw: f64) -> (f64, bool) {
    if raw.is_finite() && raw >= 0.0 {
        (raw, false)
    } else {
        (f64::MAX, true)
    }
}

/// Numeric value of a stats entry. Booleans read as 0/1.
pub fn stat_f64(stats: &StatsMap, key: &str) -> Option<f64> {
    match stats.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Weighted sum of numeric stats. Missing entries contribute nothing.
///
/// ```text
/// score = Σ weight[k] · stats[k]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedScore {
    weights: BTreeMap<String, f64>,
}

impl WeightedScore {
    pub const ID: &'static str = "weighted";

    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }

    /// Defaults used when no weights are configured.
    pub fn default_weights() -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("load".to_string(), 1.0),
            ("mem_used_ratio".to_string(), 1.0),
            ("instances".to_string(), 0.1),
        ])
    }

    /// Build from a JSON object of `stat -> weight`. An empty or null
    /// object selects [`default_weights`](Self::default_weights).
    pub fn from_params(params: &Value) -> PluginResult<Self> {
        let map = match params {
            Value::Null => return Ok(Self::new(Self::default_weights())),
            Value::Object(map) if map.is_empty() => return Ok(Self::new(Self::default_weights())),
            Value::Object(map) => map,
            other => {
                return Err(PluginError::InvalidParams {
                    id: Self::ID.to_string(),
                    reason: format!("expected a table of weights, got {other}"),
                });
            }
        };

        let mut weights = BTreeMap::new();
        for (key, value) in map {
            let weight = value.as_f64().ok_or_else(|| PluginError::InvalidParams {
                id: Self::ID.to_string(),
                reason: format!("weight for {key} must be a number"),
            })?;
            weights.insert(key.clone(), weight);
        }
        Ok(Self::new(weights))
    }
}

impl ScorePlugin for WeightedScore {
    fn id(&self) -> &str {
        Self::ID
    }

    fn score(&self, stats: &StatsMap) -> f64 {
        self.weights
            .iter()
            .filter_map(|(key, weight)| stat_f64(stats, key).map(|v| v * weight))
            .sum()
    }
}

/// Uses one stats entry as the score. Nodes that don't report the entry
/// get the worst score.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyScore {
    key: String,
}

impl KeyScore {
    pub const ID: &'static str = "key";

    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Params: `{ "key": "<stat name>" }`.
    pub fn from_params(params: &Value) -> PluginResult<Self> {
        params
            .get("key")
            .and_then(Value::as_str)
            .map(Self::new)
            .ok_or_else(|| PluginError::InvalidParams {
                id: Self::ID.to_string(),
                reason: "missing string parameter `key`".to_string(),
            })
    }
}

impl ScorePlugin for KeyScore {
    fn id(&self) -> &str {
        Self::ID
    }

    fn score(&self, stats: &StatsMap) -> f64 {
        stat_f64(stats, &self.key).unwrap_or(f64::MAX)
    }
}
