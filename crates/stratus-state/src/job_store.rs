//! [`JobRecordStore`] backed by the redb state store.
//!
//! Trees live whole in the `job_trees` table. Per-job updates decode the
//! tree, apply the change and re-encode it inside one write transaction.

use stratus_jobs::{JobRecordStore, JobState, JobTree, StoreError, StoreResult, tree_id_of};

use crate::StateStore;

fn owning_tree(job_id: &str) -> StoreResult<&str> {
    tree_id_of(job_id).ok_or_else(|| StoreError::NotFound(job_id.to_string()))
}

impl JobRecordStore for StateStore {
    fn save_tree(&self, tree: &JobTree) -> StoreResult<()> {
        Ok(self.put_job_tree(tree)?)
    }

    fn load_tree(&self, tree_id: &str) -> StoreResult<JobTree> {
        self.get_job_tree(tree_id)?
            .ok_or_else(|| StoreError::NotFound(tree_id.to_string()))
    }

    fn update_job_state(&self, job_id: &str, state: JobState) -> StoreResult<()> {
        let tree_id = owning_tree(job_id)?;
        Ok(self.modify_job_tree(tree_id, |tree| {
            Ok(tree.apply_state_update(job_id, state)?)
        })?)
    }

    fn append_log(&self, job_id: &str, line: &str) -> StoreResult<()> {
        let tree_id = owning_tree(job_id)?;
        Ok(self.modify_job_tree(tree_id, |tree| Ok(tree.append_log(job_id, line)?))?)
    }

    fn list_trees(&self) -> StoreResult<Vec<String>> {
        Ok(self.list_job_tree_ids()?)
    }
}
