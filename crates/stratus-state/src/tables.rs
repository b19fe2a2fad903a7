//! redb table definitions for the Stratus state store.
//!
//! Every table uses `&str` keys and `&[u8]` values holding JSON.

use redb::TableDefinition;

/// Shape shared by every table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Instance records keyed by `{instance_id}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Node records keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Application records (current-version pointer) keyed by `{application_id}`.
pub const APPLICATIONS: JsonTable = TableDefinition::new("applications");

/// Whole job trees keyed by `{tree_id}`, encoded by `JobTree::to_bytes`.
pub const JOB_TREES: JsonTable = TableDefinition::new("job_trees");
