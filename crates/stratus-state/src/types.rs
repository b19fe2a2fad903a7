//! Domain records persisted by the state store.
//!
//! Instances, nodes and application records. All are JSON-serialized into
//! redb tables; job trees carry their own codec in `stratus-jobs`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use stratus_core::{ApplicationId, InstanceId, NodeId, NodeRole, VersionId, epoch_secs};

/// Opaque self-reported node statistics.
pub type StatsMap = BTreeMap<String, serde_json::Value>;

// ── Instance ───────────────────────────────────────────────────────

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Record created, remote registration not yet confirmed.
    Pending,
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "PENDING",
            InstanceState::Registered => "REGISTERED",
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One deployed copy of an application version on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub application_id: ApplicationId,
    pub version_id: VersionId,
    pub node_id: NodeId,
    pub state: InstanceState,
    /// Port assigned by the node at registration.
    pub port: Option<u16>,
    /// Set when a Deregister workflow has removed the instance.
    #[serde(default)]
    pub retired: bool,
    /// Message of the remote failure that put the instance in `ERROR`.
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl InstanceRecord {
    /// A fresh `PENDING` record for an instance placed on `node_id`.
    pub fn pending(
        instance_id: impl Into<InstanceId>,
        application_id: impl Into<ApplicationId>,
        version_id: impl Into<VersionId>,
        node_id: impl Into<NodeId>,
    ) -> Self {
        let now = epoch_secs();
        Self {
            instance_id: instance_id.into(),
            application_id: application_id.into(),
            version_id: version_id.into(),
            node_id: node_id.into(),
            state: InstanceState::Pending,
            port: None,
            retired: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running && !self.retired
    }

    /// Whether the node may still be running a process for this instance.
    pub fn may_be_live(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
        )
    }

    /// Whether the instance holds its node. A registration that failed
    /// before any port was assigned left nothing behind.
    pub fn occupies_node(&self) -> bool {
        !self.retired && !(self.state == InstanceState::Error && self.port.is_none())
    }

    /// Whether this instance is live for `app`/`version`.
    pub fn belongs_to(&self, application_id: &str, version_id: &str) -> bool {
        self.application_id == application_id && self.version_id == version_id && !self.retired
    }
}

// ── Node ───────────────────────────────────────────────────────────

/// Whether a node has reported within the liveness threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    Active,
    Inactive,
}

/// A node as last seen by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub roles: BTreeSet<NodeRole>,
    /// Most recent self-reported stats.
    pub stats: StatsMap,
    /// Lower is more preferable.
    pub score: f64,
    /// Unix timestamp (seconds) of the last report.
    pub last_seen: u64,
    pub availability: Availability,
}

impl NodeRecord {
    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    /// Runtimes advertised in the `runtimes` stats entry.
    pub fn runtimes(&self) -> Vec<&str> {
        match self.stats.get("runtimes") {
            Some(serde_json::Value::Array(items)) => {
                items.iter().filter_map(|v| v.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

// ── Application ────────────────────────────────────────────────────

/// Per-application pointer to the version that serves traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub application_id: ApplicationId,
    pub current_version: Option<VersionId>,
    pub previous_version: Option<VersionId>,
    pub updated_at: u64,
}

impl ApplicationRecord {
    pub fn new(application_id: impl Into<ApplicationId>) -> Self {
        Self {
            application_id: application_id.into(),
            current_version: None,
            previous_version: None,
            updated_at: epoch_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_serializes_uppercase() {
        let json = serde_json::to_string(&InstanceState::Registered).unwrap();
        assert_eq!(json, "\"REGISTERED\"");
        assert_eq!(InstanceState::Stopping.to_string(), "STOPPING");
    }

    #[test]
    fn retired_instances_belong_to_nothing() {
        let mut inst = InstanceRecord::pending("i1", "shop", "v1", "n1");
        assert!(inst.belongs_to("shop", "v1"));
        assert!(!inst.belongs_to("shop", "v2"));

        inst.state = InstanceState::Running;
        assert!(inst.is_running());

        inst.retired = true;
        assert!(!inst.belongs_to("shop", "v1"));
        assert!(!inst.is_running());
    }

    #[test]
    fn failed_registration_frees_its_node() {
        let mut inst = InstanceRecord::pending("i1", "shop", "v1", "n1");
        assert!(inst.occupies_node());
        assert!(!inst.may_be_live());

        inst.state = InstanceState::Error;
        assert!(!inst.occupies_node());

        inst.port = Some(9001);
        assert!(inst.occupies_node());

        inst.state = InstanceState::Stopping;
        assert!(inst.may_be_live());
        inst.state = InstanceState::Stopped;
        assert!(!inst.may_be_live());
    }

    #[test]
    fn runtimes_read_from_stats() {
        let mut stats = StatsMap::new();
        stats.insert("runtimes".into(), serde_json::json!(["python", "node", 3]));
        let node = NodeRecord {
            node_id: "n1".into(),
            roles: BTreeSet::from([NodeRole::ExecutorHost]),
            stats,
            score: 0.5,
            last_seen: 0,
            availability: Availability::Active,
        };
        assert_eq!(node.runtimes(), vec!["python", "node"]);
        assert!(node.has_role(NodeRole::ExecutorHost));
        assert!(!node.has_role(NodeRole::Router));
    }

    #[test]
    fn old_instance_records_default_new_fields() {
        let json = r#"{
            "instance_id": "i1", "application_id": "shop", "version_id": "v1",
            "node_id": "n1", "state": "RUNNING", "port": 9000,
            "created_at": 1, "updated_at": 2
        }"#;
        let inst: InstanceRecord = serde_json::from_str(json).unwrap();
        assert!(!inst.retired);
        assert!(inst.last_error.is_none());
        assert_eq!(inst.port, Some(9000));
    }
}
