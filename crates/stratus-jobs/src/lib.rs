//! stratus-jobs: persistent, recoverable, tree-structured job coordination.
//!
//! Every multi-step, multi-node operation of the control plane runs as a
//! [`JobTree`]: a root job plus descendants, each child list run either
//! sequentially or in parallel. The [`Executor`] drives a tree through the
//! per-job state machine, invoking one [`JobHandler`] per job type.
//!
//! # Architecture
//!
//! ```text
//!   JobSpec ──build──► JobTree ──run──► Executor ──► HandlerRegistry ──► JobHandler
//!                                          │
//!                                          ▼
//!                                   JobRecordStore (MemoryJobStore, redb StateStore)
//! ```
//!
//! Trees are written through to the [`JobRecordStore`] on every change, so
//! a restarted controller can [`Executor::recover`] whatever was in flight.
//! Only transient remote failures are retried automatically; everything
//! else fails the job, and failures of required children aggregate upwards
//! until the root names every root-cause leaf.

pub mod error;
pub mod executor;
pub mod handler;
pub mod store;
pub mod tree;

pub use error::{ExecError, ExecResult, JobError, StoreError, StoreResult, TreeError};
pub use executor::{Executor, ExecutorOptions, TreeOutcome};
pub use handler::{HandlerOutput, HandlerRegistry, JobContext, JobHandler, handler_fn};
pub use store::{JobRecordStore, MemoryJobStore};
pub use tree::{
    Context, ExecutionMode, FailureKind, Job, JobFailure, JobId, JobSpec, JobState, JobTree,
    job_id, tree_id_of,
};
