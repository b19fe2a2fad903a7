//! stratus-state: embedded state store for the Stratus control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for instances, nodes, application records and job trees.
//!
//! # Architecture
//!
//! ```text
//!   Coordinator / NodeRegistry ──► StateStore ──► redb tables
//!                                      ▲            instances, nodes,
//!   Executor ── JobRecordStore ────────┘            applications, job_trees
//! ```
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns. The
//! `StateStore` is `Clone + Send + Sync` (backed by `Arc<Database>`) and is
//! shared between the executor, the registry and the workflows.

pub mod error;
pub mod job_store;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
