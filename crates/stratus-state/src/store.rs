//! StateStore: redb-backed persistence for the control plane.
//!
//! Typed CRUD over instances, nodes, application records and job trees.
//! Read-modify-write helpers run inside a single write transaction, so two
//! writers racing on one record never interleave.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use stratus_core::{TreeId, epoch_secs};
use stratus_jobs::JobTree;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        txn.open_table(JOB_TREES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Read, modify and write back one record in a single write
    /// transaction. `init` supplies the record when the key is absent; if
    /// it returns `None` the key is reported missing via `missing`.
    fn modify<T, R>(
        &self,
        table: JsonTable,
        key: &str,
        init: impl FnOnce() -> Option<T>,
        missing: impl FnOnce() -> StateError,
        f: impl FnOnce(&mut T) -> StateResult<R>,
    ) -> StateResult<(T, R)>
    where
        T: Serialize + DeserializeOwned,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (record, out) = {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let existing = match t.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<T>(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            let mut record = match existing.or_else(init) {
                Some(record) => record,
                None => return Err(missing()),
            };
            let out = f(&mut record)?;
            let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
            (record, out)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok((record, out))
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, instance: &InstanceRecord) -> StateResult<()> {
        self.put(INSTANCES, &instance.instance_id, instance)?;
        debug!(instance = %instance.instance_id, state = %instance.state, "instance stored");
        Ok(())
    }

    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<InstanceRecord>> {
        self.get(INSTANCES, instance_id)
    }

    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.list(INSTANCES)
    }

    /// Non-retired instances of one application version.
    pub fn list_instances_for_version(
        &self,
        application_id: &str,
        version_id: &str,
    ) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.belongs_to(application_id, version_id))
            .collect())
    }

    /// Non-retired instances of any version of an application.
    pub fn list_instances_for_application(
        &self,
        application_id: &str,
    ) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.application_id == application_id && !i.retired)
            .collect())
    }

    /// Atomically modify an existing instance. Bumps `updated_at`.
    pub fn update_instance(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut InstanceRecord),
    ) -> StateResult<InstanceRecord> {
        let (record, ()) = self.modify(
            INSTANCES,
            instance_id,
            || None,
            || StateError::UnknownInstance(instance_id.to_string()),
            |inst: &mut InstanceRecord| {
                f(inst);
                inst.updated_at = epoch_secs();
                Ok(())
            },
        )?;
        debug!(instance = %instance_id, state = %record.state, "instance updated");
        Ok(record)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.put(NODES, &node.node_id, node)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.get(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.list(NODES)
    }

    // ── Applications ───────────────────────────────────────────────

    pub fn put_application(&self, app: &ApplicationRecord) -> StateResult<()> {
        self.put(APPLICATIONS, &app.application_id, app)
    }

    pub fn get_application(&self, application_id: &str) -> StateResult<Option<ApplicationRecord>> {
        self.get(APPLICATIONS, application_id)
    }

    /// Current version of an application, if one has been promoted.
    pub fn current_version(&self, application_id: &str) -> StateResult<Option<String>> {
        Ok(self
            .get_application(application_id)?
            .and_then(|app| app.current_version))
    }

    /// Point the application at `version_id` in one write transaction,
    /// keeping the old pointer as `previous_version`. Creates the record
    /// on first use.
    pub fn set_current_version(
        &self,
        application_id: &str,
        version_id: &str,
    ) -> StateResult<ApplicationRecord> {
        let (record, ()) = self.modify(
            APPLICATIONS,
            application_id,
            || Some(ApplicationRecord::new(application_id)),
            || StateError::UnknownApplication(application_id.to_string()),
            |app: &mut ApplicationRecord| {
                if app.current_version.as_deref() != Some(version_id) {
                    app.previous_version = app.current_version.take();
                    app.current_version = Some(version_id.to_string());
                }
                app.updated_at = epoch_secs();
                Ok(())
            },
        )?;
        debug!(
            application = %application_id,
            current = ?record.current_version,
            previous = ?record.previous_version,
            "current version set"
        );
        Ok(record)
    }

    // ── Job trees ──────────────────────────────────────────────────

    pub fn put_job_tree(&self, tree: &JobTree) -> StateResult<()> {
        let bytes = tree.to_bytes()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(JOB_TREES).map_err(map_err!(Table))?;
            t.insert(tree.id(), bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_job_tree(&self, tree_id: &str) -> StateResult<Option<JobTree>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(JOB_TREES).map_err(map_err!(Table))?;
        match t.get(tree_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(JobTree::from_bytes(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_job_tree_ids(&self) -> StateResult<Vec<TreeId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(JOB_TREES).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    /// Modify a stored job tree in a single write transaction.
    pub fn modify_job_tree<R>(
        &self,
        tree_id: &str,
        f: impl FnOnce(&mut JobTree) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out = {
            let mut t = txn.open_table(JOB_TREES).map_err(map_err!(Table))?;
            let mut tree = match t.get(tree_id).map_err(map_err!(Read))? {
                Some(guard) => JobTree::from_bytes(guard.value())?,
                None => return Err(StateError::UnknownTree(tree_id.to_string())),
            };
            let out = f(&mut tree)?;
            let bytes = tree.to_bytes()?;
            t.insert(tree_id, bytes.as_slice()).map_err(map_err!(Write))?;
            out
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }
}
