//! Remote node operation contract.
//!
//! One request descriptor with an enumerated operation kind covers every
//! call the controller makes to an executor-host. Transport is up to the
//! [`NodeClient`] implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stratus_core::{ApplicationId, InstanceId, NodeId, VersionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RegisterInstance,
    StartInstance,
    StopInstance,
    RemoveInstance,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::RegisterInstance,
        OperationKind::StartInstance,
        OperationKind::StopInstance,
        OperationKind::RemoveInstance,
    ];

    /// Job type tag of the per-node job that performs this operation.
    pub fn job_type(&self) -> &'static str {
        match self {
            OperationKind::RegisterInstance => "register_instance",
            OperationKind::StartInstance => "start_instance",
            OperationKind::StopInstance => "stop_instance",
            OperationKind::RemoveInstance => "remove_instance",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_type())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub instance_id: InstanceId,
    pub application_id: ApplicationId,
    pub version_id: VersionId,
    /// Requested port. Only meaningful for registration.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    /// Port the node assigned, for registration.
    pub port: Option<u16>,
    pub message: Option<String>,
}

impl OperationResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_port(port: u16) -> Self {
        Self {
            port: Some(port),
            message: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure; the executor retries these up to its bound.
    #[error("communication with node failed: {0}")]
    Comm(String),

    /// The node processed the call and refused it.
    #[error("node rejected the operation: {0}")]
    Rejected(String),
}

/// Client side of the remote node operation contract.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn call(
        &self,
        node_id: &NodeId,
        request: OperationRequest,
    ) -> Result<OperationResponse, RemoteError>;
}
