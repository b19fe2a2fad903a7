//! Job persistence contract.
//!
//! The executor persists every tree through a [`JobRecordStore`]: the
//! whole tree when a run starts, per-job state transitions and log lines
//! as they happen, and a full snapshot whenever failure detail or handler
//! output changes. [`MemoryJobStore`] keeps encoded trees in a map and is
//! meant for tests and embedding; durable backends live elsewhere.

use std::collections::HashMap;
use std::sync::RwLock;

use stratus_core::TreeId;

use crate::error::{StoreError, StoreResult};
use crate::tree::{JobState, JobTree, tree_id_of};

/// Durable storage for job trees.
pub trait JobRecordStore: Send + Sync {
    /// Insert or replace a whole tree.
    fn save_tree(&self, tree: &JobTree) -> StoreResult<()>;

    /// Load a tree by id. Missing trees are [`StoreError::NotFound`].
    fn load_tree(&self, tree_id: &str) -> StoreResult<JobTree>;

    /// Record a state transition of one job.
    fn update_job_state(&self, job_id: &str, state: JobState) -> StoreResult<()>;

    /// Append a log line to one job.
    fn append_log(&self, job_id: &str, line: &str) -> StoreResult<()>;

    /// Ids of every stored tree.
    fn list_trees(&self) -> StoreResult<Vec<TreeId>>;
}

/// In-memory [`JobRecordStore`] holding encoded trees.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    trees: RwLock<HashMap<TreeId, Vec<u8>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify(&self, job_id: &str, f: impl FnOnce(&mut JobTree) -> StoreResult<()>) -> StoreResult<()> {
        let tree_id = tree_id_of(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?
            .to_string();
        let mut trees = self
            .trees
            .write()
            .map_err(|_| StoreError::Backend("job store lock poisoned".to_string()))?;
        let bytes = trees
            .get(&tree_id)
            .ok_or_else(|| StoreError::NotFound(tree_id.clone()))?;
        let mut tree = JobTree::from_bytes(bytes)?;
        f(&mut tree)?;
        trees.insert(tree_id, tree.to_bytes()?);
        Ok(())
    }
}

impl JobRecordStore for MemoryJobStore {
    fn save_tree(&self, tree: &JobTree) -> StoreResult<()> {
        let bytes = tree.to_bytes()?;
        self.trees
            .write()
            .map_err(|_| StoreError::Backend("job store lock poisoned".to_string()))?
            .insert(tree.id().to_string(), bytes);
        Ok(())
    }

    fn load_tree(&self, tree_id: &str) -> StoreResult<JobTree> {
        let trees = self
            .trees
            .read()
            .map_err(|_| StoreError::Backend("job store lock poisoned".to_string()))?;
        let bytes = trees
            .get(tree_id)
            .ok_or_else(|| StoreError::NotFound(tree_id.to_string()))?;
        Ok(JobTree::from_bytes(bytes)?)
    }

    fn update_job_state(&self, job_id: &str, state: JobState) -> StoreResult<()> {
        self.modify(job_id, |tree| Ok(tree.apply_state_update(job_id, state)?))
    }

    fn append_log(&self, job_id: &str, line: &str) -> StoreResult<()> {
        self.modify(job_id, |tree| Ok(tree.append_log(job_id, line)?))
    }

    fn list_trees(&self) -> StoreResult<Vec<TreeId>> {
        let trees = self
            .trees
            .read()
            .map_err(|_| StoreError::Backend("job store lock poisoned".to_string()))?;
        let mut ids: Vec<TreeId> = trees.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
