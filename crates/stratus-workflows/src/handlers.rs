//! Job handlers behind the workflow trees.
//!
//! Per-node jobs carry `instance_id` and `node_id` in their context and
//! are the only writers of the instance record they address:
//!
//! ```text
//!   register_instance   PENDING ──────────────► REGISTERED (+port)
//!   start_instance      ─► STARTING ──────────► RUNNING
//!   stop_instance       ─► STOPPING ──────────► STOPPED
//!   remove_instance     (not live) ───────────► STOPPED, retired
//!                         any final failure ──► ERROR (last_error)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use stratus_jobs::{HandlerOutput, HandlerRegistry, JobContext, JobError, JobHandler};
use stratus_state::{InstanceRecord, InstanceState, StateStore};

use crate::remote::{NodeClient, OperationKind, OperationRequest, RemoteError};

/// Job type of the current-version flip.
pub const SWITCH_CURRENT_VERSION: &str = "switch_current_version";

/// Every handler the workflows need, keyed by job type.
pub fn workflow_handlers(state: StateStore, client: Arc<dyn NodeClient>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    for kind in OperationKind::ALL {
        handlers = handlers.with(
            kind.job_type(),
            Arc::new(InstanceOpHandler::new(kind, state.clone(), client.clone())),
        );
    }
    handlers.with(SWITCH_CURRENT_VERSION, Arc::new(SwitchCurrentHandler::new(state)))
}

/// Runs one remote instance operation and keeps the record in step.
pub struct InstanceOpHandler {
    kind: OperationKind,
    state: StateStore,
    client: Arc<dyn NodeClient>,
}

impl InstanceOpHandler {
    pub fn new(kind: OperationKind, state: StateStore, client: Arc<dyn NodeClient>) -> Self {
        Self {
            kind,
            state,
            client,
        }
    }

    fn before(&self) -> Option<InstanceState> {
        match self.kind {
            OperationKind::StartInstance => Some(InstanceState::Starting),
            OperationKind::StopInstance => Some(InstanceState::Stopping),
            OperationKind::RegisterInstance | OperationKind::RemoveInstance => None,
        }
    }

    fn update(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut InstanceRecord),
    ) -> Result<InstanceRecord, JobError> {
        self.state
            .update_instance(instance_id, f)
            .map_err(|e| JobError::Handler(format!("state store: {e}")))
    }

    fn mark_error(&self, instance_id: &str, message: &str) {
        let result = self.update(instance_id, |inst| {
            inst.state = InstanceState::Error;
            inst.last_error = Some(message.to_string());
        });
        if let Err(e) = result {
            warn!(instance = %instance_id, error = %e, "failed to record instance error");
        }
    }
}

#[async_trait]
impl JobHandler for InstanceOpHandler {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, JobError> {
        let instance_id = ctx.str_param("instance_id")?.to_string();
        let node_id = ctx.str_param("node_id")?.to_string();
        let requested_port = ctx.opt_param::<u16>("port")?;

        let instance = self
            .state
            .get_instance(&instance_id)
            .map_err(|e| JobError::Handler(format!("state store: {e}")))?
            .ok_or_else(|| JobError::Validation(format!("unknown instance {instance_id}")))?;
        if instance.node_id != node_id {
            return Err(JobError::Validation(format!(
                "instance {instance_id} is assigned to {}, not {node_id}",
                instance.node_id
            )));
        }
        if self.kind == OperationKind::RemoveInstance && instance.may_be_live() {
            return Err(JobError::Validation(format!(
                "instance {instance_id} is {}, stop it before removal",
                instance.state
            )));
        }
        ctx.checkpoint()?;

        if let Some(state) = self.before() {
            self.update(&instance_id, |inst| inst.state = state)?;
        }

        let request = OperationRequest {
            kind: self.kind,
            instance_id: instance_id.clone(),
            application_id: instance.application_id.clone(),
            version_id: instance.version_id.clone(),
            port: requested_port.or(instance.port),
        };
        debug!(instance = %instance_id, node = %node_id, op = %self.kind, attempt = ctx.attempt, "calling node");

        let response = match self.client.call(&node_id, request).await {
            Ok(response) => response,
            Err(RemoteError::Comm(msg)) => {
                if ctx.is_last_attempt() {
                    self.mark_error(&instance_id, &msg);
                }
                return Err(JobError::RemoteComm(msg));
            }
            Err(RemoteError::Rejected(msg)) => {
                self.mark_error(&instance_id, &msg);
                return Err(JobError::Handler(msg));
            }
        };

        let kind = self.kind;
        let record = self.update(&instance_id, |inst| {
            inst.last_error = None;
            match kind {
                OperationKind::RegisterInstance => {
                    inst.state = InstanceState::Registered;
                    inst.port = response.port.or(requested_port);
                }
                OperationKind::StartInstance => inst.state = InstanceState::Running,
                OperationKind::StopInstance => inst.state = InstanceState::Stopped,
                OperationKind::RemoveInstance => {
                    inst.state = InstanceState::Stopped;
                    inst.retired = true;
                }
            }
        })?;
        info!(instance = %instance_id, node = %node_id, op = %kind, state = %record.state, "instance operation done");

        let mut output = HandlerOutput::empty().log(format!("{kind} on {node_id}: {}", record.state));
        if let Some(port) = record.port {
            output = output.with("port", port);
        }
        if let Some(message) = response.message {
            output = output.log(message);
        }
        Ok(output)
    }
}

/// Flips the application's current-version pointer.
pub struct SwitchCurrentHandler {
    state: StateStore,
}

impl SwitchCurrentHandler {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

#[async_trait]
impl JobHandler for SwitchCurrentHandler {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, JobError> {
        let application_id = ctx.str_param("application_id")?;
        let version_id = ctx.str_param("version_id")?;
        ctx.checkpoint()?;

        let record = self
            .state
            .set_current_version(application_id, version_id)
            .map_err(|e| JobError::Handler(format!("state store: {e}")))?;
        info!(application = %application_id, current = %version_id, previous = ?record.previous_version, "current version switched");

        let previous = record.previous_version.as_deref().unwrap_or("none");
        Ok(HandlerOutput::empty().log(format!("current version {previous} -> {version_id}")))
    }
}
