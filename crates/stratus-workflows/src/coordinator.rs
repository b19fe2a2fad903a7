//! Coordinator: builds workflow trees and hands them to the executor.
//!
//! Preconditions and placement are checked here, before any tree exists.
//! Once a tree is built, everything else is the executor's business and
//! shows up in the returned [`WorkflowRun`].

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use stratus_core::{InstanceId, StratusConfig};
use stratus_jobs::{Executor, ExecutorOptions, JobRecordStore, JobTree, TreeOutcome};
use stratus_placement::{InstanceRequirements, NodeRegistry, Placer, PluginRegistry};
use stratus_state::{InstanceRecord, InstanceState, NodeRecord, StateStore};

use crate::builder::{
    InstanceTarget, Outgoing, WorkflowKind, deregister_tree, register_tree, shutdown_tree,
    startup_tree, switch_current_tree, workflow_of,
};
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::workflow_handlers;
use crate::remote::NodeClient;

/// Result of one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub kind: WorkflowKind,
    pub outcome: TreeOutcome,
    /// Instances addressed by the run's per-node jobs.
    pub instances: Vec<InstanceId>,
}

impl WorkflowRun {
    pub fn tree_id(&self) -> &str {
        &self.outcome.tree_id
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Register request: how many instances of which version, placed where.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub requirements: InstanceRequirements,
    pub count: usize,
    /// Port asked of every node; the node may assign another.
    pub port: Option<u16>,
}

impl RegisterRequest {
    pub fn new(requirements: InstanceRequirements, count: usize) -> Self {
        Self {
            requirements,
            count,
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

#[derive(Clone)]
pub struct Coordinator {
    executor: Executor,
    state: StateStore,
    registry: NodeRegistry,
    placer: Placer,
}

impl Coordinator {
    pub fn new(
        state: StateStore,
        registry: NodeRegistry,
        placer: Placer,
        client: Arc<dyn NodeClient>,
    ) -> Self {
        let handlers = workflow_handlers(state.clone(), client);
        let store: Arc<dyn JobRecordStore> = Arc::new(state.clone());
        Self {
            executor: Executor::new(store, handlers),
            state,
            registry,
            placer,
        }
    }

    /// Wire everything from `stratus.toml`.
    pub fn from_config(
        config: &StratusConfig,
        state: StateStore,
        client: Arc<dyn NodeClient>,
        plugins: &PluginRegistry,
    ) -> WorkflowResult<Self> {
        let registry = NodeRegistry::from_config(state.clone(), &config.registry, plugins)?;
        let placer = Placer::from_config(&config.placement, plugins)?;
        Ok(Self::new(state, registry, placer, client)
            .with_executor_options(ExecutorOptions::from(&config.executor)))
    }

    pub fn with_executor_options(mut self, options: ExecutorOptions) -> Self {
        self.executor = self.executor.with_options(options);
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Choose a node for each of `count` new instances.
    ///
    /// Nodes already hosting the version, and nodes chosen earlier in the
    /// same call, count for anti-affinity. Failed registrations do not.
    pub fn place(&self, requirements: &InstanceRequirements, count: usize) -> WorkflowResult<Vec<NodeRecord>> {
        let snapshot = self.registry.list(Some(requirements.role), true)?;
        let mut req = requirements.clone().with_occupied(
            self.state
                .list_instances_for_version(&requirements.application_id, &requirements.version_id)?
                .into_iter()
                .filter(InstanceRecord::occupies_node)
                .map(|inst| inst.node_id),
        );

        let mut chosen = Vec::with_capacity(count);
        for _ in 0..count {
            let node = self.placer.choose(&req, &snapshot)?;
            req.occupied_nodes.insert(node.node_id.clone());
            chosen.push(node);
        }
        Ok(chosen)
    }

    /// Place, record and register `count` new instances.
    pub async fn register(&self, request: RegisterRequest) -> WorkflowResult<WorkflowRun> {
        let app = request.requirements.application_id.clone();
        let version = request.requirements.version_id.clone();
        if request.count == 0 {
            return Err(WorkflowError::Precondition(format!(
                "register of {app}/{version} needs at least one instance"
            )));
        }

        let nodes = self.place(&request.requirements, request.count)?;
        let mut targets = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let record = InstanceRecord::pending(Uuid::new_v4().to_string(), &app, &version, &node.node_id);
            self.state.put_instance(&record)?;
            targets.push(InstanceTarget {
                port: request.port,
                ..InstanceTarget::from(&record)
            });
        }
        info!(application = %app, version = %version, count = targets.len(), "registering instances");

        let tree = register_tree(&app, &version, &targets);
        self.execute(WorkflowKind::Register, tree, &targets).await
    }

    /// Start every registered or stopped instance of a version.
    pub async fn startup(&self, application_id: &str, version_id: &str) -> WorkflowResult<WorkflowRun> {
        let targets = self.targets(application_id, version_id, startable)?;
        if targets.is_empty() {
            return Err(WorkflowError::Precondition(format!(
                "no startable instances of {application_id}/{version_id}"
            )));
        }
        let tree = startup_tree(application_id, version_id, &targets);
        self.execute(WorkflowKind::Startup, tree, &targets).await
    }

    /// Stop every running instance of a version.
    pub async fn shutdown(&self, application_id: &str, version_id: &str) -> WorkflowResult<WorkflowRun> {
        let targets = self.targets(application_id, version_id, stoppable)?;
        if targets.is_empty() {
            return Err(WorkflowError::Precondition(format!(
                "no running instances of {application_id}/{version_id}"
            )));
        }
        let tree = shutdown_tree(application_id, version_id, &targets);
        self.execute(WorkflowKind::Shutdown, tree, &targets).await
    }

    /// Remove and retire every instance of a version.
    ///
    /// `paired_shutdown` must name a Shutdown tree of the same version that
    /// has reached a terminal state, and no instance of the version may
    /// still be running on its node.
    pub async fn deregister(
        &self,
        application_id: &str,
        version_id: &str,
        paired_shutdown: &str,
    ) -> WorkflowResult<WorkflowRun> {
        let shutdown = self.executor.tree(paired_shutdown).await.map_err(|e| {
            WorkflowError::Precondition(format!("paired shutdown {paired_shutdown} unavailable: {e}"))
        })?;
        check_paired_shutdown(&shutdown, application_id, version_id)?;

        let instances = self.state.list_instances_for_version(application_id, version_id)?;
        let live: Vec<&str> = instances
            .iter()
            .filter(|inst| inst.may_be_live() || inst.state == InstanceState::Pending)
            .map(|inst| inst.instance_id.as_str())
            .collect();
        if !live.is_empty() {
            return Err(WorkflowError::Precondition(format!(
                "{application_id}/{version_id} still has live instances after shutdown {paired_shutdown}: {}",
                live.join(", ")
            )));
        }

        let targets = self.targets(application_id, version_id, |_| true)?;
        if targets.is_empty() {
            return Err(WorkflowError::Precondition(format!(
                "no instances of {application_id}/{version_id} to deregister"
            )));
        }
        let tree = deregister_tree(application_id, version_id, &targets, paired_shutdown);
        self.execute(WorkflowKind::Deregister, tree, &targets).await
    }

    /// Shutdown followed by its paired Deregister. Nothing is removed
    /// unless the shutdown succeeded.
    pub async fn retire(&self, application_id: &str, version_id: &str) -> WorkflowResult<(WorkflowRun, WorkflowRun)> {
        let shutdown = self.shutdown(application_id, version_id).await?;
        if !shutdown.is_success() {
            warn!(application = %application_id, version = %version_id, tree = %shutdown.tree_id(), "shutdown did not succeed, keeping instances registered");
            return Err(WorkflowError::Precondition(format!(
                "shutdown {} of {application_id}/{version_id} ended {}",
                shutdown.tree_id(),
                shutdown.outcome.state
            )));
        }
        let deregister = self
            .deregister(application_id, version_id, shutdown.tree_id())
            .await?;
        Ok((shutdown, deregister))
    }

    /// Start `version_id`, make it current, then stop the old current
    /// version. A failed startup leaves the pointer and the old instances
    /// untouched.
    pub async fn switch_current(&self, application_id: &str, version_id: &str) -> WorkflowResult<WorkflowRun> {
        let current = self.state.current_version(application_id)?;
        if current.as_deref() == Some(version_id) {
            return Err(WorkflowError::Precondition(format!(
                "{version_id} is already the current version of {application_id}"
            )));
        }

        let incoming = self.targets(application_id, version_id, startable)?;
        let already_running = self
            .state
            .list_instances_for_version(application_id, version_id)?
            .iter()
            .filter(|inst| inst.is_running())
            .count();
        if incoming.is_empty() && already_running == 0 {
            return Err(WorkflowError::Precondition(format!(
                "{application_id}/{version_id} has no instances to serve traffic"
            )));
        }

        let outgoing = match current {
            Some(old) => Some(Outgoing {
                targets: self.targets(application_id, &old, stoppable)?,
                version_id: old,
            }),
            None => None,
        };

        let mut addressed = incoming.clone();
        if let Some(old) = &outgoing {
            addressed.extend(old.targets.iter().cloned());
        }
        let tree = switch_current_tree(application_id, version_id, &incoming, outgoing.as_ref());
        self.execute(WorkflowKind::SwitchCurrent, tree, &addressed).await
    }

    /// Resume every interrupted workflow tree.
    pub async fn recover(&self) -> WorkflowResult<Vec<TreeOutcome>> {
        Ok(self.executor.recover().await?)
    }

    fn targets(
        &self,
        application_id: &str,
        version_id: &str,
        keep: impl Fn(&InstanceRecord) -> bool,
    ) -> WorkflowResult<Vec<InstanceTarget>> {
        let mut instances = self.state.list_instances_for_version(application_id, version_id)?;
        instances.sort_by(|a, b| a.node_id.cmp(&b.node_id).then_with(|| a.instance_id.cmp(&b.instance_id)));
        Ok(instances.iter().filter(|i| keep(i)).map(InstanceTarget::from).collect())
    }

    async fn execute(
        &self,
        kind: WorkflowKind,
        tree: JobTree,
        targets: &[InstanceTarget],
    ) -> WorkflowResult<WorkflowRun> {
        let tree_id = tree.id().to_string();
        let outcome = self.executor.run(tree).await?;
        if outcome.is_success() {
            info!(workflow = %kind, tree = %tree_id, "workflow succeeded");
        } else {
            warn!(
                workflow = %kind,
                tree = %tree_id,
                state = %outcome.state,
                failure = ?outcome.failure.as_ref().map(|f| &f.message),
                "workflow did not succeed"
            );
        }
        Ok(WorkflowRun {
            kind,
            outcome,
            instances: targets.iter().map(|t| t.instance_id.clone()).collect(),
        })
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry)
            .field("placer", &self.placer)
            .finish()
    }
}

fn startable(inst: &InstanceRecord) -> bool {
    match inst.state {
        InstanceState::Registered | InstanceState::Starting | InstanceState::Stopped => true,
        // Registration succeeded earlier, a later operation failed.
        InstanceState::Error => inst.port.is_some(),
        InstanceState::Pending | InstanceState::Running | InstanceState::Stopping => false,
    }
}

fn stoppable(inst: &InstanceRecord) -> bool {
    matches!(
        inst.state,
        InstanceState::Running | InstanceState::Starting | InstanceState::Stopping
    )
}

fn check_paired_shutdown(tree: &JobTree, application_id: &str, version_id: &str) -> WorkflowResult<()> {
    let matches = workflow_of(tree) == Some(WorkflowKind::Shutdown)
        && tree.label("application_id") == Some(application_id)
        && tree.label("version_id") == Some(version_id);
    if !matches {
        return Err(WorkflowError::Precondition(format!(
            "tree {} is not a shutdown of {application_id}/{version_id}",
            tree.id()
        )));
    }
    if !tree.is_terminal() {
        return Err(WorkflowError::Precondition(format!(
            "paired shutdown {} is still {}",
            tree.id(),
            tree.state()
        )));
    }
    Ok(())
}
