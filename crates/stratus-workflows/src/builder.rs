//! Job tree shapes of the coordination workflows.
//!
//! ```text
//!   register / startup / shutdown / deregister      switch_current (sequential)
//!   root (parallel)                                 ├─ startup  (parallel, per new instance)
//!   ├─ <op>_instance {instance_id, node_id}         ├─ switch_current_version
//!   ├─ <op>_instance ...                            └─ shutdown (parallel, per old instance)
//!   └─ ...
//! ```
//!
//! Every tree is labelled with `workflow`, `application_id` and
//! `version_id`; the root context carries the same application and
//! version so every descendant can see them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use stratus_core::{InstanceId, NodeId, TreeId};
use stratus_jobs::{JobSpec, JobTree};
use stratus_state::InstanceRecord;

use crate::handlers::SWITCH_CURRENT_VERSION;
use crate::remote::OperationKind;

/// Label naming the Shutdown tree a Deregister tree is paired with.
pub const PAIRED_SHUTDOWN_LABEL: &str = "paired_shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Register,
    Startup,
    Shutdown,
    Deregister,
    SwitchCurrent,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Register => "register",
            WorkflowKind::Startup => "startup",
            WorkflowKind::Shutdown => "shutdown",
            WorkflowKind::Deregister => "deregister",
            WorkflowKind::SwitchCurrent => "switch_current",
        }
    }

    /// Remote operation run by each per-node job, if the workflow has one.
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            WorkflowKind::Register => Some(OperationKind::RegisterInstance),
            WorkflowKind::Startup => Some(OperationKind::StartInstance),
            WorkflowKind::Shutdown => Some(OperationKind::StopInstance),
            WorkflowKind::Deregister => Some(OperationKind::RemoveInstance),
            WorkflowKind::SwitchCurrent => None,
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance a per-node job addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub port: Option<u16>,
}

impl From<&InstanceRecord> for InstanceTarget {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            node_id: record.node_id.clone(),
            port: record.port,
        }
    }
}

fn labels(kind: WorkflowKind, application_id: &str, version_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("workflow".to_string(), kind.as_str().to_string()),
        ("application_id".to_string(), application_id.to_string()),
        ("version_id".to_string(), version_id.to_string()),
    ])
}

fn instance_job(op: OperationKind, target: &InstanceTarget) -> JobSpec {
    let spec = JobSpec::new(op.job_type())
        .param("instance_id", target.instance_id.as_str())
        .param("node_id", target.node_id.as_str());
    match target.port {
        Some(port) if op == OperationKind::RegisterInstance => spec.param("port", port),
        _ => spec,
    }
}

/// Grouping job running `op` on every target at once.
fn fan_out(group: WorkflowKind, op: OperationKind, targets: &[InstanceTarget]) -> JobSpec {
    JobSpec::new(group.as_str())
        .parallel(targets.iter().map(|t| instance_job(op, t)).collect())
}

fn instance_tree(
    kind: WorkflowKind,
    op: OperationKind,
    application_id: &str,
    version_id: &str,
    targets: &[InstanceTarget],
) -> JobTree {
    let root = fan_out(kind, op, targets)
        .param("application_id", application_id)
        .param("version_id", version_id);
    JobTree::build(kind.as_str(), labels(kind, application_id, version_id), root)
}

pub fn register_tree(application_id: &str, version_id: &str, targets: &[InstanceTarget]) -> JobTree {
    instance_tree(
        WorkflowKind::Register,
        OperationKind::RegisterInstance,
        application_id,
        version_id,
        targets,
    )
}

pub fn startup_tree(application_id: &str, version_id: &str, targets: &[InstanceTarget]) -> JobTree {
    instance_tree(
        WorkflowKind::Startup,
        OperationKind::StartInstance,
        application_id,
        version_id,
        targets,
    )
}

pub fn shutdown_tree(application_id: &str, version_id: &str, targets: &[InstanceTarget]) -> JobTree {
    instance_tree(
        WorkflowKind::Shutdown,
        OperationKind::StopInstance,
        application_id,
        version_id,
        targets,
    )
}

/// Deregister tree, labelled with the Shutdown tree it follows.
pub fn deregister_tree(
    application_id: &str,
    version_id: &str,
    targets: &[InstanceTarget],
    paired_shutdown: &str,
) -> JobTree {
    let kind = WorkflowKind::Deregister;
    let root = fan_out(kind, OperationKind::RemoveInstance, targets)
        .param("application_id", application_id)
        .param("version_id", version_id);
    let mut labels = labels(kind, application_id, version_id);
    labels.insert(PAIRED_SHUTDOWN_LABEL.to_string(), paired_shutdown.to_string());
    JobTree::build(kind.as_str(), labels, root)
}

/// Old version being replaced by a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub version_id: String,
    pub targets: Vec<InstanceTarget>,
}

/// Startup of `incoming` (skipped when empty), then the pointer flip,
/// then Shutdown of the outgoing version (skipped when there is none).
pub fn switch_current_tree(
    application_id: &str,
    version_id: &str,
    incoming: &[InstanceTarget],
    outgoing: Option<&Outgoing>,
) -> JobTree {
    let mut steps = Vec::new();
    if !incoming.is_empty() {
        steps.push(fan_out(WorkflowKind::Startup, OperationKind::StartInstance, incoming));
    }
    steps.push(JobSpec::new(SWITCH_CURRENT_VERSION));
    if let Some(old) = outgoing.filter(|o| !o.targets.is_empty()) {
        steps.push(
            fan_out(WorkflowKind::Shutdown, OperationKind::StopInstance, &old.targets)
                .param("version_id", old.version_id.as_str()),
        );
    }

    let kind = WorkflowKind::SwitchCurrent;
    let root = JobSpec::new(kind.as_str())
        .param("application_id", application_id)
        .param("version_id", version_id)
        .sequential(steps);
    let mut labels = labels(kind, application_id, version_id);
    if let Some(old) = outgoing {
        labels.insert("previous_version".to_string(), old.version_id.clone());
    }
    JobTree::build(kind.as_str(), labels, root)
}

/// The tree's `workflow` label parsed back, if present.
pub fn workflow_of(tree: &JobTree) -> Option<WorkflowKind> {
    match tree.label("workflow")? {
        "register" => Some(WorkflowKind::Register),
        "startup" => Some(WorkflowKind::Startup),
        "shutdown" => Some(WorkflowKind::Shutdown),
        "deregister" => Some(WorkflowKind::Deregister),
        "switch_current" => Some(WorkflowKind::SwitchCurrent),
        _ => None,
    }
}

/// Id of the Shutdown tree a Deregister tree is paired with.
pub fn paired_shutdown_of(tree: &JobTree) -> Option<TreeId> {
    tree.label(PAIRED_SHUTDOWN_LABEL).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_jobs::{ExecutionMode, JobState};

    fn targets(n: usize) -> Vec<InstanceTarget> {
        (1..=n)
            .map(|i| InstanceTarget {
                instance_id: format!("i{i}"),
                node_id: format!("n{i}"),
                port: Some(9000 + i as u16),
            })
            .collect()
    }

    #[test]
    fn startup_fans_out_one_job_per_instance() {
        let tree = startup_tree("shop", "v1", &targets(3));
        assert_eq!(tree.kind(), "startup");
        assert_eq!(tree.label("application_id"), Some("shop"));
        assert_eq!(workflow_of(&tree), Some(WorkflowKind::Startup));
        assert_eq!(tree.root().mode, ExecutionMode::Parallel);

        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 3);
        assert!(leaves.iter().all(|j| j.job_type == "start_instance"));
        assert!(leaves.iter().all(|j| !j.context.contains_key("port")));
        assert!(tree.jobs().all(|j| j.state == JobState::New));

        let ctx = tree.effective_context(&leaves[1].id).unwrap();
        assert_eq!(ctx["version_id"], "v1");
        assert_eq!(ctx["node_id"], "n2");
    }

    #[test]
    fn register_children_carry_requested_port() {
        let tree = register_tree("shop", "v1", &targets(2));
        let leaves = tree.leaves();
        assert_eq!(leaves[0].job_type, "register_instance");
        assert_eq!(leaves[0].context["port"], 9001);
    }

    #[test]
    fn deregister_names_its_shutdown() {
        let tree = deregister_tree("shop", "v1", &targets(1), "shutdown-tree");
        assert_eq!(paired_shutdown_of(&tree).as_deref(), Some("shutdown-tree"));
        assert_eq!(tree.leaves()[0].job_type, "remove_instance");
    }

    #[test]
    fn switch_orders_startup_flip_shutdown() {
        let old = Outgoing {
            version_id: "v1".into(),
            targets: targets(2),
        };
        let tree = switch_current_tree("shop", "v2", &targets(1), Some(&old));
        assert_eq!(tree.root().mode, ExecutionMode::Sequential);
        assert_eq!(tree.label("previous_version"), Some("v1"));

        let steps: Vec<&str> = tree
            .children_of(tree.root_id())
            .iter()
            .map(|j| j.job_type.as_str())
            .collect();
        assert_eq!(steps, vec!["startup", SWITCH_CURRENT_VERSION, "shutdown"]);

        let first_switch = switch_current_tree("shop", "v1", &targets(1), None);
        assert_eq!(first_switch.children_of(first_switch.root_id()).len(), 2);
    }
}
