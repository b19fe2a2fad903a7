//! Error types for the registry, plugins and placement.

use thiserror::Error;

use stratus_core::{ApplicationId, VersionId};
use stratus_state::StateError;

/// Plugin lookup and construction failures.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no {capability} plugin registered as {id:?}")]
    Unknown { capability: &'static str, id: String },

    #[error("invalid parameters for {id}: {reason}")]
    InvalidParams { id: String, reason: String },
}

pub type PluginResult<T> = Result<T, PluginError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    /// Raised to the workflow initiator before any job tree is built.
    #[error("no eligible node for {application_id}/{version_id} among {candidates} candidates")]
    NoEligibleNode {
        application_id: ApplicationId,
        version_id: VersionId,
        candidates: usize,
    },

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
