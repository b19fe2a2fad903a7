//! Workflow error types.

use thiserror::Error;

use stratus_jobs::ExecError;
use stratus_placement::{PlacementError, RegistryError};
use stratus_state::StateError;

/// Errors raised before or around a workflow run.
///
/// Failures inside the tree are not errors here: they are reported on the
/// tree and surface through the run's root outcome.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("executor error: {0}")]
    Exec(#[from] ExecError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
