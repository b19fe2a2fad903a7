//! stratus-workflows: the coordination workflows of the control plane.
//!
//! Register, Startup, Shutdown, Deregister and Current-Version-Switch are
//! each one job tree run by the `stratus-jobs` executor. Their per-node
//! jobs call executor-hosts through a [`NodeClient`] and are the only
//! writers of the instance records they address.
//!
//! # Architecture
//!
//! ```text
//!   caller ─► Coordinator ─┬─► Placer (register only, before any tree)
//!                          ├─► builder  ─► JobTree
//!                          └─► Executor ─► InstanceOpHandler ─► NodeClient ─► node
//!                                    │             │
//!                                    ▼             ▼
//!                              job_trees      instances / applications (StateStore)
//! ```

pub mod builder;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod remote;

pub use builder::{InstanceTarget, Outgoing, WorkflowKind, paired_shutdown_of, workflow_of};
pub use coordinator::{Coordinator, RegisterRequest, WorkflowRun};
pub use error::{WorkflowError, WorkflowResult};
pub use handlers::{InstanceOpHandler, SWITCH_CURRENT_VERSION, SwitchCurrentHandler, workflow_handlers};
pub use remote::{NodeClient, OperationKind, OperationRequest, OperationResponse, RemoteError};
