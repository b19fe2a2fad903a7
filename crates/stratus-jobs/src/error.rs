//! Error types for the job coordination engine.

use std::time::Duration;

use thiserror::Error;

use stratus_core::TreeId;

use crate::tree::{FailureKind, JobId, JobState};

/// Failure returned by a job handler.
///
/// The variant decides what the executor does next: only
/// [`JobError::RemoteComm`] is retried automatically.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    /// The job's context is malformed. Fatal to the job.
    #[error("invalid job context: {0}")]
    Validation(String),

    /// The call to a remote node failed in transport.
    #[error("remote communication failed: {0}")]
    RemoteComm(String),

    /// The operation itself failed.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The job exceeded its declared deadline.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// The handler stopped at a checkpoint because the job was aborted.
    #[error("job aborted")]
    Aborted,
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Validation(_) => FailureKind::Validation,
            JobError::RemoteComm(_) => FailureKind::RemoteComm,
            JobError::Handler(_) => FailureKind::Handler,
            JobError::Timeout(_) => FailureKind::Timeout,
            JobError::Aborted => FailureKind::Aborted,
        }
    }

    /// Whether the executor may retry the handler after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::RemoteComm(_))
    }
}

/// Errors in the job tree model itself.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("job not found in tree: {0}")]
    UnknownJob(JobId),

    #[error("malformed job tree record: {0}")]
    Malformed(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors raised by a [`JobRecordStore`](crate::store::JobRecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job tree not found: {0}")]
    NotFound(TreeId),

    #[error("job record backend error: {0}")]
    Backend(String),

    #[error("job record codec error: {0}")]
    Codec(#[from] TreeError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the [`Executor`](crate::executor::Executor) API.
///
/// Job failures are never reported here; they live on the tree and reach
/// the caller through [`TreeOutcome`](crate::executor::TreeOutcome).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("job tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("job tree is already running: {0}")]
    AlreadyRunning(TreeId),

    #[error("job {job} cannot be retried from state {state}")]
    NotRetryable { job: JobId, state: JobState },

    #[error("job {job} cannot be retried: ancestor {ancestor} is {state}")]
    SettledAncestor {
        job: JobId,
        ancestor: JobId,
        state: JobState,
    },

    #[error("only leaf jobs can be retried: {0}")]
    NotLeaf(JobId),

    #[error("executor task failed: {0}")]
    Join(String),
}

pub type ExecResult<T> = Result<T, ExecError>;
