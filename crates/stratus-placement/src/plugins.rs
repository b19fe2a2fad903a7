//! Typed plugin registry: capability id to factory.
//!
//! Populated once at startup (built-ins plus anything the embedding
//! program adds) and then only read. Three capabilities exist: score,
//! stats and placement filter.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use stratus_core::{PlacementConfig, RegistryConfig};

use crate::error::{PluginError, PluginResult};
use crate::filter::{NotDraining, PlacementFilter};
use crate::scorer::{KeyScore, ScorePlugin, WeightedScore};
use crate::stats::{ReportSequence, StaticStats, StatsCollector};

pub type ScoreFactory = Arc<dyn Fn(&Value) -> PluginResult<Arc<dyn ScorePlugin>> + Send + Sync>;
pub type StatsFactory = Arc<dyn Fn(&Value) -> PluginResult<Arc<dyn StatsCollector>> + Send + Sync>;
pub type FilterFactory =
    Arc<dyn Fn(&Value) -> PluginResult<Arc<dyn PlacementFilter>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct PluginRegistry {
    score: BTreeMap<String, ScoreFactory>,
    stats: BTreeMap<String, StatsFactory>,
    filters: BTreeMap<String, FilterFactory>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in plugin.
    pub fn builtin() -> Self {
        Self::new()
            .with_score(WeightedScore::ID, Arc::new(weighted_score))
            .with_score(KeyScore::ID, Arc::new(key_score))
            .with_stats(StaticStats::ID, Arc::new(static_stats))
            .with_stats(ReportSequence::ID, Arc::new(report_sequence))
            .with_filter(NotDraining::ID, Arc::new(not_draining))
    }

    pub fn with_score(mut self, id: impl Into<String>, factory: ScoreFactory) -> Self {
        self.score.insert(id.into(), factory);
        self
    }

    pub fn with_stats(mut self, id: impl Into<String>, factory: StatsFactory) -> Self {
        self.stats.insert(id.into(), factory);
        self
    }

    pub fn with_filter(mut self, id: impl Into<String>, factory: FilterFactory) -> Self {
        self.filters.insert(id.into(), factory);
        self
    }

    pub fn score(&self, id: &str, params: &Value) -> PluginResult<Arc<dyn ScorePlugin>> {
        let factory = self.score.get(id).ok_or_else(|| unknown("score", id))?;
        factory(params)
    }

    pub fn stats(&self, id: &str, params: &Value) -> PluginResult<Arc<dyn StatsCollector>> {
        let factory = self.stats.get(id).ok_or_else(|| unknown("stats", id))?;
        factory(params)
    }

    pub fn filter(&self, id: &str, params: &Value) -> PluginResult<Arc<dyn PlacementFilter>> {
        let factory = self.filters.get(id).ok_or_else(|| unknown("placement filter", id))?;
        factory(params)
    }

    /// The score plugin selected by `[registry]`.
    pub fn score_from_config(&self, config: &RegistryConfig) -> PluginResult<Arc<dyn ScorePlugin>> {
        self.score(&config.score_plugin, &config.score_params_json())
    }

    /// Every filter listed in `[placement] filters`, in order.
    pub fn filters_from_config(
        &self,
        config: &PlacementConfig,
    ) -> PluginResult<Vec<Arc<dyn PlacementFilter>>> {
        config
            .filters
            .iter()
            .map(|id| self.filter(id, &Value::Null))
            .collect()
    }

    /// Registered ids per capability, for diagnostics.
    pub fn capabilities(&self) -> BTreeMap<&'static str, Vec<String>> {
        BTreeMap::from([
            ("score", self.score.keys().cloned().collect()),
            ("stats", self.stats.keys().cloned().collect()),
            ("filter", self.filters.keys().cloned().collect()),
        ])
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

fn weighted_score(params: &Value) -> PluginResult<Arc<dyn ScorePlugin>> {
    Ok(Arc::new(WeightedScore::from_params(params)?))
}

fn key_score(params: &Value) -> PluginResult<Arc<dyn ScorePlugin>> {
    Ok(Arc::new(KeyScore::from_params(params)?))
}

fn static_stats(params: &Value) -> PluginResult<Arc<dyn StatsCollector>> {
    Ok(Arc::new(StaticStats::from_params(params)?))
}

fn report_sequence(_params: &Value) -> PluginResult<Arc<dyn StatsCollector>> {
    Ok(Arc::new(ReportSequence::new()))
}

fn not_draining(params: &Value) -> PluginResult<Arc<dyn PlacementFilter>> {
    Ok(Arc::new(NotDraining::from_params(params)?))
}

fn unknown(capability: &'static str, id: &str) -> PluginError {
    PluginError::Unknown {
        capability,
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stratus_state::StatsMap;

    #[test]
    fn builtins_are_registered() {
        let plugins = PluginRegistry::builtin();
        let caps = plugins.capabilities();
        assert_eq!(caps["score"], vec!["key", "weighted"]);
        assert_eq!(caps["stats"], vec!["report-sequence", "static"]);
        assert_eq!(caps["filter"], vec!["not-draining"]);
    }

    #[test]
    fn score_plugin_built_from_config() {
        let config = RegistryConfig {
            score_plugin: "key".into(),
            score_params: toml_table(&[("key", "load")]),
            ..RegistryConfig::default()
        };
        let scorer = PluginRegistry::builtin().score_from_config(&config).unwrap();

        let mut stats = StatsMap::new();
        stats.insert("load".into(), json!(0.4));
        assert_eq!(scorer.id(), "key");
        assert_eq!(scorer.score(&stats), 0.4);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let plugins = PluginRegistry::builtin();
        let err = match plugins.score("fancy", &Value::Null) {
            Err(e) => e,
            Ok(_) => panic!("fancy should not resolve"),
        };
        assert!(matches!(err, PluginError::Unknown { capability: "score", .. }));
        assert!(
            plugins
                .filters_from_config(&PlacementConfig {
                    filters: vec!["not-draining".into(), "gpu-only".into()],
                })
                .is_err()
        );
    }

    #[test]
    fn custom_factories_can_be_added() {
        struct Constant;
        impl ScorePlugin for Constant {
            fn id(&self) -> &str {
                "constant"
            }
            fn score(&self, _stats: &StatsMap) -> f64 {
                1.0
            }
        }

        let plugins = PluginRegistry::builtin().with_score(
            "constant",
            Arc::new(|_: &Value| Ok::<_, PluginError>(Arc::new(Constant) as Arc<dyn ScorePlugin>)),
        );
        let scorer = plugins.score("constant", &Value::Null).unwrap();
        assert_eq!(scorer.score(&StatsMap::new()), 1.0);
    }

    fn toml_table(pairs: &[(&str, &str)]) -> toml::Table {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), toml::Value::String(v.to_string())))
            .collect()
    }
}
