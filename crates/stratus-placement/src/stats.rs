//! Stats plugins: collect a node's self-reported statistics.
//!
//! Each collector receives the stats gathered so far and returns them
//! updated. A [`StatsPipeline`] chains collectors in order; the node's
//! reporter runs it once per report cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use stratus_state::StatsMap;

use crate::error::{PluginError, PluginResult};

/// Stats contract: `collect(existing) -> updated`, merging.
pub trait StatsCollector: Send + Sync {
    fn id(&self) -> &str;

    fn collect(&self, existing: StatsMap) -> StatsMap;
}

/// Ordered chain of collectors.
#[derive(Clone, Default)]
pub struct StatsPipeline {
    collectors: Vec<Arc<dyn StatsCollector>>,
}

impl StatsPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, collector: Arc<dyn StatsCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    pub fn collect(&self, existing: StatsMap) -> StatsMap {
        self.collectors
            .iter()
            .fold(existing, |stats, collector| collector.collect(stats))
    }
}

impl std::fmt::Debug for StatsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.collectors.iter().map(|c| c.id()).collect();
        f.debug_struct("StatsPipeline").field("collectors", &ids).finish()
    }
}

/// Overlays fixed entries, e.g. advertised runtimes or a drain flag.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticStats {
    entries: StatsMap,
}

impl StaticStats {
    pub const ID: &'static str = "static";

    pub fn new(entries: StatsMap) -> Self {
        Self { entries }
    }

    /// Params: a JSON object whose entries are copied verbatim.
    pub fn from_params(params: &Value) -> PluginResult<Self> {
        match params {
            Value::Null => Ok(Self::new(StatsMap::new())),
            Value::Object(map) => Ok(Self::new(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            other => Err(PluginError::InvalidParams {
                id: Self::ID.to_string(),
                reason: format!("expected a table of entries, got {other}"),
            }),
        }
    }
}

impl StatsCollector for StaticStats {
    fn id(&self) -> &str {
        Self::ID
    }

    fn collect(&self, mut existing: StatsMap) -> StatsMap {
        existing.extend(self.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        existing
    }
}

/// Stamps each report with a monotonically increasing `report_seq`.
#[derive(Debug, Default)]
pub struct ReportSequence {
    next: AtomicU64,
}

impl ReportSequence {
    pub const ID: &'static str = "report-sequence";

    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsCollector for ReportSequence {
    fn id(&self) -> &str {
        Self::ID
    }

    fn collect(&self, mut existing: StatsMap) -> StatsMap {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        existing.insert("report_seq".to_string(), Value::from(seq));
        existing
    }
}
