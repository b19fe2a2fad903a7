//! Node-side reporter: runs the stats pipeline and feeds the registry.
//!
//! Every node runs one of these for itself. A report is the node's own
//! previous stats pushed through the pipeline, then scored and written
//! by [`NodeRegistry::report`].

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use stratus_core::{NodeId, NodeRole};
use stratus_state::{NodeRecord, StatsMap};

use crate::error::RegistryResult;
use crate::registry::NodeRegistry;
use crate::stats::StatsPipeline;

pub struct NodeReporter {
    node_id: NodeId,
    roles: BTreeSet<NodeRole>,
    pipeline: StatsPipeline,
    registry: NodeRegistry,
}

impl NodeReporter {
    pub fn new(
        node_id: impl Into<NodeId>,
        roles: impl IntoIterator<Item = NodeRole>,
        pipeline: StatsPipeline,
        registry: NodeRegistry,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            roles: roles.into_iter().collect(),
            pipeline,
            registry,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Collect and publish a single report.
    pub fn report_once(&self) -> RegistryResult<NodeRecord> {
        let existing = self
            .registry
            .get(&self.node_id)?
            .map(|node| node.stats)
            .unwrap_or_else(StatsMap::new);
        let stats = self.pipeline.collect(existing);
        self.registry
            .report(&self.node_id, self.roles.iter().copied(), stats)
    }

    /// Report immediately, then every `interval` until `shutdown` flips.
    ///
    /// A failed report is logged and the loop keeps going; the node simply
    /// reads as stale until a later report lands.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(node = %self.node_id, ?interval, "node reporter started");
        self.publish();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.publish();
                }
                _ = shutdown.changed() => {
                    debug!(node = %self.node_id, "node reporter shutting down");
                    break;
                }
            }
        }
    }

    fn publish(&self) {
        match self.report_once() {
            Ok(node) => debug!(node = %node.node_id, score = node.score, "report published"),
            Err(e) => error!(node = %self.node_id, error = %e, "failed to publish node report"),
        }
    }
}
