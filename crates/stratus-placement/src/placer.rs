//! Placement engine: picks the executor-host that receives a new instance.
//!
//! Works on a snapshot of node records and never writes registry state,
//! so a stale snapshot yields a stale but consistent decision.
//!
//! 1. Eligibility: required role, required runtimes, active nodes only
//! 2. Anti-affinity: skip nodes already hosting the same app/version,
//!    unless co-location is explicitly allowed
//! 3. Pluggable filters (e.g. `not-draining`)
//! 4. Sort ascending by score, ties broken by node id; take the first

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use stratus_core::{ApplicationId, NodeId, NodeRole, PlacementConfig, VersionId};
use stratus_state::{Availability, NodeRecord};

use crate::error::{PlacementError, PlacementResult};
use crate::filter::PlacementFilter;
use crate::plugins::PluginRegistry;

/// What a new instance needs from its node.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequirements {
    pub application_id: ApplicationId,
    pub version_id: VersionId,
    pub role: NodeRole,
    /// Every runtime listed must appear in the node's `runtimes` stat.
    pub runtimes: Vec<String>,
    /// Nodes already hosting an instance of the same application version.
    pub occupied_nodes: BTreeSet<NodeId>,
    /// Allow placing next to an existing instance of the same version.
    pub co_locate: bool,
}

impl InstanceRequirements {
    pub fn new(application_id: impl Into<ApplicationId>, version_id: impl Into<VersionId>) -> Self {
        Self {
            application_id: application_id.into(),
            version_id: version_id.into(),
            role: NodeRole::ExecutorHost,
            runtimes: Vec::new(),
            occupied_nodes: BTreeSet::new(),
            co_locate: false,
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtimes.push(runtime.into());
        self
    }

    pub fn with_occupied(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.occupied_nodes.extend(nodes);
        self
    }

    pub fn allow_co_location(mut self) -> Self {
        self.co_locate = true;
        self
    }
}

/// Stateless placement engine with its configured filter chain.
#[derive(Clone, Default)]
pub struct Placer {
    filters: Vec<Arc<dyn PlacementFilter>>,
}

impl Placer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Arc<dyn PlacementFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Build the filter chain named in `[placement] filters`.
    pub fn from_config(config: &PlacementConfig, plugins: &PluginRegistry) -> PlacementResult<Self> {
        let mut placer = Self::new();
        for id in &config.filters {
            placer = placer.with_filter(plugins.filter(id, &serde_json::Value::Null)?);
        }
        Ok(placer)
    }

    pub fn filter_ids(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.id()).collect()
    }

    /// Every eligible candidate, best first.
    pub fn rank(&self, req: &InstanceRequirements, candidates: &[NodeRecord]) -> Vec<NodeRecord> {
        let mut eligible: Vec<NodeRecord> = candidates
            .iter()
            .filter(|node| self.eligible(node, req))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        eligible
    }

    /// The best eligible candidate, or [`PlacementError::NoEligibleNode`].
    pub fn choose(
        &self,
        req: &InstanceRequirements,
        candidates: &[NodeRecord],
    ) -> PlacementResult<NodeRecord> {
        match self.rank(req, candidates).into_iter().next() {
            Some(node) => {
                debug!(
                    application = %req.application_id,
                    version = %req.version_id,
                    node = %node.node_id,
                    score = node.score,
                    "placement chosen"
                );
                Ok(node)
            }
            None => {
                warn!(
                    application = %req.application_id,
                    version = %req.version_id,
                    candidates = candidates.len(),
                    "no eligible node"
                );
                Err(PlacementError::NoEligibleNode {
                    application_id: req.application_id.clone(),
                    version_id: req.version_id.clone(),
                    candidates: candidates.len(),
                })
            }
        }
    }

    fn eligible(&self, node: &NodeRecord, req: &InstanceRequirements) -> bool {
        if node.availability != Availability::Active || !node.has_role(req.role) {
            return false;
        }
        let runtimes = node.runtimes();
        if !req.runtimes.iter().all(|r| runtimes.contains(&r.as_str())) {
            return false;
        }
        if !req.co_locate && req.occupied_nodes.contains(&node.node_id) {
            return false;
        }
        self.filters.iter().all(|f| f.admits(node, req))
    }
}

impl std::fmt::Debug for Placer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Placer")
            .field("filters", &self.filter_ids())
            .finish()
    }
}
