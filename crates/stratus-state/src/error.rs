//! Error types for the Stratus state store.

use thiserror::Error;

use stratus_core::{ApplicationId, InstanceId, TreeId};
use stratus_jobs::{StoreError, TreeError};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by [`StateStore`](crate::StateStore).
///
/// Backend variants carry redb's message; the `Unknown*` variants are
/// lookups that required a record to exist.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("unknown application: {0}")]
    UnknownApplication(ApplicationId),

    #[error("unknown job tree: {0}")]
    UnknownTree(TreeId),

    #[error("job record error: {0}")]
    JobRecord(#[from] TreeError),
}

impl From<StateError> for StoreError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::UnknownTree(id) => StoreError::NotFound(id),
            StateError::JobRecord(e) => StoreError::Codec(e),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
