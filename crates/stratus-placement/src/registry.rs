//! Node registry: per-node records fed by the nodes' own reports.
//!
//! Each node's record is written only by that node's periodic report
//! (last write wins, no locking across nodes). Availability is never
//! written by anyone else: it is derived at read time from `last_seen`
//! against the liveness threshold.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use stratus_core::{NodeRole, RegistryConfig, epoch_secs};
use stratus_state::{Availability, NodeRecord, StateStore, StatsMap};

use crate::error::RegistryResult;
use crate::plugins::PluginRegistry;
use crate::scorer::{ScorePlugin, sanitize_score};

#[derive(Clone)]
pub struct NodeRegistry {
    state: StateStore,
    scorer: Arc<dyn ScorePlugin>,
    liveness: Duration,
}

impl NodeRegistry {
    pub fn new(state: StateStore, scorer: Arc<dyn ScorePlugin>) -> Self {
        Self {
            state,
            scorer,
            liveness: Duration::from_secs(30),
        }
    }

    /// Build from `[registry]`, resolving the score plugin by id.
    pub fn from_config(
        state: StateStore,
        config: &RegistryConfig,
        plugins: &PluginRegistry,
    ) -> RegistryResult<Self> {
        let scorer = plugins.score_from_config(config)?;
        Ok(Self::new(state, scorer).with_liveness(Duration::from_secs(config.liveness_secs)))
    }

    /// Time without a report after which a node reads as inactive.
    pub fn with_liveness(mut self, liveness: Duration) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    pub fn scorer_id(&self) -> &str {
        self.scorer.id()
    }

    /// Ingest a report from `node_id`.
    ///
    /// The first report creates the record. Empty `roles` keep whatever
    /// roles the node declared earlier.
    pub fn report(
        &self,
        node_id: &str,
        roles: impl IntoIterator<Item = NodeRole>,
        stats: StatsMap,
    ) -> RegistryResult<NodeRecord> {
        self.report_at(node_id, roles, stats, epoch_secs())
    }

    /// [`report`](Self::report) with an explicit timestamp.
    pub fn report_at(
        &self,
        node_id: &str,
        roles: impl IntoIterator<Item = NodeRole>,
        stats: StatsMap,
        now: u64,
    ) -> RegistryResult<NodeRecord> {
        let mut roles: BTreeSet<NodeRole> = roles.into_iter().collect();
        let previous = self.state.get_node(node_id)?;
        if roles.is_empty() {
            if let Some(prev) = &previous {
                roles = prev.roles.clone();
            }
        }

        let (score, clamped) = sanitize_score(self.scorer.score(&stats));
        if clamped {
            warn!(node = %node_id, scorer = self.scorer.id(), "score plugin returned an invalid score, using worst score");
        }

        let record = NodeRecord {
            node_id: node_id.to_string(),
            roles,
            stats,
            score,
            last_seen: now,
            availability: Availability::Active,
        };
        self.state.put_node(&record)?;

        if previous.is_none() {
            debug!(node = %node_id, roles = ?record.roles, "node registered on first report");
        } else {
            debug!(node = %node_id, score, "node report ingested");
        }
        Ok(record)
    }

    pub fn get(&self, node_id: &str) -> RegistryResult<Option<NodeRecord>> {
        self.get_at(node_id, epoch_secs())
    }

    pub fn get_at(&self, node_id: &str, now: u64) -> RegistryResult<Option<NodeRecord>> {
        Ok(self
            .state
            .get_node(node_id)?
            .map(|node| self.with_availability(node, now)))
    }

    /// Snapshot of the registry, optionally narrowed to one role and to
    /// active nodes. Sorted by node id.
    pub fn list(&self, role: Option<NodeRole>, only_active: bool) -> RegistryResult<Vec<NodeRecord>> {
        self.list_at(role, only_active, epoch_secs())
    }

    pub fn list_at(
        &self,
        role: Option<NodeRole>,
        only_active: bool,
        now: u64,
    ) -> RegistryResult<Vec<NodeRecord>> {
        let mut nodes: Vec<NodeRecord> = self
            .state
            .list_nodes()?
            .into_iter()
            .map(|node| self.with_availability(node, now))
            .filter(|node| role.is_none_or(|r| node.has_role(r)))
            .filter(|node| !only_active || node.availability == Availability::Active)
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    pub fn active_count(&self) -> RegistryResult<usize> {
        Ok(self.list(None, true)?.len())
    }

    fn with_availability(&self, mut node: NodeRecord, now: u64) -> NodeRecord {
        let silent_for = now.saturating_sub(node.last_seen);
        node.availability = if silent_for > self.liveness.as_secs() {
            Availability::Inactive
        } else {
            Availability::Active
        };
        node
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("scorer", &self.scorer.id())
            .field("liveness", &self.liveness)
            .finish()
    }
}
