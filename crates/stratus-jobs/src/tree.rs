//! Job tree model: one workflow run as a tree of typed jobs.
//!
//! A tree is built once from a [`JobSpec`] and its shape never changes
//! afterwards: jobs are stored in pre-order and addressed by
//! `{tree_id}:{index}`. Parent links belong to the tree, not to the jobs.
//! Only the executor (and record stores replaying persisted updates)
//! mutate job state.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stratus_core::{TreeId, epoch_secs};

use crate::error::TreeError;

/// Identifier of a job, `{tree_id}:{index}`.
pub type JobId = String;

/// Opaque handler input, JSON object.
pub type Context = Map<String, Value>;

/// Lifecycle state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Ready,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "NEW",
            JobState::Ready => "READY",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// How a job runs its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Strictly in declared order, short-circuiting on a required failure.
    Sequential,
    /// All at once; a required failure fails the parent but running
    /// siblings are left to finish.
    #[default]
    Parallel,
}

/// Classification of a recorded job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    RemoteComm,
    Handler,
    Timeout,
    Aborted,
    /// One or more required children did not succeed.
    ChildFailed,
}

/// Failure recorded on a job node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Root-cause leaves, for aggregated failures. Empty for leaf failures.
    #[serde(default)]
    pub failed_jobs: Vec<JobId>,
}

/// Declarative description of a job and its children, used to build a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_type: String,
    pub context: Context,
    pub required: bool,
    pub timeout: Option<Duration>,
    pub mode: ExecutionMode,
    pub children: Vec<JobSpec>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            context: Context::new(),
            required: true,
            timeout: None,
            mode: ExecutionMode::default(),
            children: Vec::new(),
        }
    }

    /// Set one context entry.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context.extend(context);
        self
    }

    /// Mark the job optional: its failure does not fail the parent.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn sequential(mut self, children: Vec<JobSpec>) -> Self {
        self.mode = ExecutionMode::Sequential;
        self.children = children;
        self
    }

    pub fn parallel(mut self, children: Vec<JobSpec>) -> Self {
        self.mode = ExecutionMode::Parallel;
        self.children = children;
        self
    }
}

/// A single job node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub children: Vec<JobId>,
    pub mode: ExecutionMode,
    pub state: JobState,
    pub context: Context,
    pub timeout_ms: Option<u64>,
    pub logs: Vec<String>,
    pub required: bool,
    pub failure: Option<JobFailure>,
    /// Handler invocations so far, across retries and resumes.
    pub attempts: u32,
    /// The job's own handler has completed and its output is merged.
    pub handled: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Job {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// One workflow instance: a root job plus all descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTree {
    id: TreeId,
    kind: String,
    labels: BTreeMap<String, String>,
    /// Jobs in pre-order; index 0 is the root.
    jobs: Vec<Job>,
    /// Parent index of each job, parallel to `jobs`.
    parents: Vec<Option<usize>>,
    created_at: u64,
}

/// Build the id of the job at `index` in tree `tree_id`.
pub fn job_id(tree_id: &str, index: usize) -> JobId {
    format!("{tree_id}:{index}")
}

/// Extract the tree id from a job id.
pub fn tree_id_of(job_id: &str) -> Option<&str> {
    job_id.rsplit_once(':').map(|(tree, _)| tree)
}

impl JobTree {
    /// Build a tree with a fresh id.
    pub fn build(kind: impl Into<String>, labels: BTreeMap<String, String>, root: JobSpec) -> Self {
        Self::build_with_id(uuid::Uuid::new_v4().to_string(), kind, labels, root)
    }

    /// Build a tree with a caller-chosen id.
    pub fn build_with_id(
        id: impl Into<TreeId>,
        kind: impl Into<String>,
        labels: BTreeMap<String, String>,
        root: JobSpec,
    ) -> Self {
        let id = id.into();
        let now = epoch_secs();
        let mut jobs = Vec::new();
        let mut parents = Vec::new();
        flatten(root, None, &id, now, &mut jobs, &mut parents);
        // The root has no parent to tolerate its failure.
        jobs[0].required = true;

        Self {
            id,
            kind: kind.into(),
            labels,
            jobs,
            parents,
            created_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Workflow kind tag ("startup", "register", ...).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn root(&self) -> &Job {
        &self.jobs[0]
    }

    pub fn root_id(&self) -> &str {
        &self.jobs[0].id
    }

    /// Externally visible state of the tree: the root's state.
    pub fn state(&self) -> JobState {
        self.jobs[0].state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All jobs in pre-order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.index_of(id).map(|i| &self.jobs[i])
    }

    /// Current state of any job in the tree.
    pub fn state_of(&self, id: &str) -> Option<JobState> {
        self.job(id).map(|j| j.state)
    }

    pub fn parent_of(&self, id: &str) -> Option<&Job> {
        let index = self.index_of(id)?;
        self.parents[index].map(|p| &self.jobs[p])
    }

    pub fn children_of(&self, id: &str) -> Vec<&Job> {
        match self.job(id) {
            Some(job) => job.children.iter().filter_map(|c| self.job(c)).collect(),
            None => Vec::new(),
        }
    }

    /// Ids of every descendant of `id` in pre-order, excluding `id`.
    pub fn descendants(&self, id: &str) -> Vec<JobId> {
        let mut out = Vec::new();
        if let Some(job) = self.job(id) {
            for child in &job.children {
                out.push(child.clone());
                out.extend(self.descendants(child));
            }
        }
        out
    }

    pub fn leaves(&self) -> Vec<&Job> {
        self.jobs.iter().filter(|j| j.is_leaf()).collect()
    }

    pub fn failed_leaves(&self) -> Vec<&Job> {
        self.jobs
            .iter()
            .filter(|j| j.is_leaf() && j.state == JobState::Failed)
            .collect()
    }

    /// Failure recorded on the root, if the tree failed.
    pub fn root_failure(&self) -> Option<&JobFailure> {
        self.jobs[0].failure.as_ref()
    }

    /// Context a handler sees: ancestors' contexts merged root first, then
    /// the job's own entries.
    pub fn effective_context(&self, id: &str) -> Option<Context> {
        let mut index = self.index_of(id)?;
        let mut chain = vec![index];
        while let Some(parent) = self.parents[index] {
            chain.push(parent);
            index = parent;
        }

        let mut merged = Context::new();
        for i in chain.into_iter().rev() {
            for (k, v) in &self.jobs[i].context {
                merged.insert(k.clone(), v.clone());
            }
        }
        Some(merged)
    }

    /// Append a log line to a job.
    pub fn append_log(&mut self, id: &str, line: impl Into<String>) -> Result<(), TreeError> {
        let job = self.job_mut(id)?;
        job.logs.push(line.into());
        job.updated_at = epoch_secs();
        Ok(())
    }

    /// Every log line in the tree, pre-order, prefixed with job id and type.
    pub fn log_replay(&self) -> Vec<String> {
        self.jobs
            .iter()
            .flat_map(|job| {
                job.logs
                    .iter()
                    .map(move |line| format!("[{} {}] {}", job.id, job.job_type, line))
            })
            .collect()
    }

    /// Apply a state recorded by a job store, without transition checks.
    ///
    /// Record stores use this to replay `update_job_state` onto the
    /// persisted copy; the live tree goes through the executor.
    pub fn apply_state_update(&mut self, id: &str, state: JobState) -> Result<(), TreeError> {
        let job = self.job_mut(id)?;
        job.state = state;
        job.updated_at = epoch_secs();
        Ok(())
    }

    /// Serialize the whole tree for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TreeError> {
        serde_json::to_vec(self).map_err(|e| TreeError::Encode(e.to_string()))
    }

    /// Deserialize and structurally validate a persisted tree.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TreeError> {
        let tree: JobTree =
            serde_json::from_slice(bytes).map_err(|e| TreeError::Decode(e.to_string()))?;
        tree.validate()?;
        Ok(tree)
    }

    fn validate(&self) -> Result<(), TreeError> {
        if self.jobs.is_empty() {
            return Err(TreeError::Malformed("tree has no root job".to_string()));
        }
        if self.jobs.len() != self.parents.len() {
            return Err(TreeError::Malformed(format!(
                "{} jobs but {} parent links",
                self.jobs.len(),
                self.parents.len()
            )));
        }
        for (index, job) in self.jobs.iter().enumerate() {
            if job.id != job_id(&self.id, index) {
                return Err(TreeError::Malformed(format!(
                    "job at position {index} has id {}",
                    job.id
                )));
            }
            for child in &job.children {
                let child_index = self
                    .index_of(child)
                    .ok_or_else(|| TreeError::Malformed(format!("dangling child {child}")))?;
                if self.parents[child_index] != Some(index) {
                    return Err(TreeError::Malformed(format!(
                        "child {child} does not point back at {}",
                        job.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn index_of(&self, id: &str) -> Option<usize> {
        let rest = id.strip_prefix(self.id.as_str())?.strip_prefix(':')?;
        rest.parse::<usize>().ok().filter(|i| *i < self.jobs.len())
    }

    pub(crate) fn job_mut(&mut self, id: &str) -> Result<&mut Job, TreeError> {
        let index = self
            .index_of(id)
            .ok_or_else(|| TreeError::UnknownJob(id.to_string()))?;
        Ok(&mut self.jobs[index])
    }

    /// Move a job to `state`. Terminal states are never left this way.
    ///
    /// Returns the job's state after the call.
    pub(crate) fn set_state(&mut self, id: &str, state: JobState) -> Result<JobState, TreeError> {
        let job = self.job_mut(id)?;
        if !job.state.is_terminal() {
            job.state = state;
            job.updated_at = epoch_secs();
        }
        Ok(job.state)
    }

    /// Mark `id` and every non-terminal descendant aborted, depth-first.
    ///
    /// Returns the ids that changed.
    pub(crate) fn abort_subtree(&mut self, id: &str) -> Result<Vec<JobId>, TreeError> {
        let index = self
            .index_of(id)
            .ok_or_else(|| TreeError::UnknownJob(id.to_string()))?;
        let mut marked = Vec::new();
        self.abort_at(index, &mut marked);
        Ok(marked)
    }

    fn abort_at(&mut self, index: usize, marked: &mut Vec<JobId>) {
        let now = epoch_secs();
        let job = &mut self.jobs[index];
        if !job.state.is_terminal() {
            job.state = JobState::Aborted;
            job.updated_at = now;
            job.logs.push("aborted".to_string());
            marked.push(job.id.clone());
        }
        let children: Vec<usize> = job
            .children
            .iter()
            .filter_map(|c| c.rsplit_once(':').and_then(|(_, i)| i.parse().ok()))
            .collect();
        for child in children {
            self.abort_at(child, marked);
        }
    }

    /// First ancestor of `id` that is not `FAILED`. A retried leaf is only
    /// reachable by a later drive when every ancestor reopens with it.
    pub(crate) fn settled_ancestor(&self, id: &str) -> Option<&Job> {
        let mut index = self.index_of(id)?;
        while let Some(parent) = self.parents[index] {
            if self.jobs[parent].state != JobState::Failed {
                return Some(&self.jobs[parent]);
            }
            index = parent;
        }
        None
    }

    /// Reset a failed job to `READY` and clear the aggregated failure on its
    /// failed ancestors so they re-evaluate on the next run. Siblings are
    /// not touched.
    ///
    /// Returns the ids that changed, the job itself first.
    pub(crate) fn reset_failed(&mut self, id: &str) -> Result<Vec<JobId>, TreeError> {
        let mut index = self
            .index_of(id)
            .ok_or_else(|| TreeError::UnknownJob(id.to_string()))?;
        let now = epoch_secs();
        let mut changed = Vec::new();

        let job = &mut self.jobs[index];
        job.state = JobState::Ready;
        job.failure = None;
        job.handled = false;
        job.updated_at = now;
        job.logs.push("retry requested".to_string());
        changed.push(job.id.clone());

        while let Some(parent) = self.parents[index] {
            let job = &mut self.jobs[parent];
            if job.state == JobState::Failed {
                job.state = JobState::Ready;
                job.failure = None;
                job.updated_at = now;
                job.logs.push(format!("re-evaluating after retry of {id}"));
                changed.push(job.id.clone());
            }
            index = parent;
        }
        Ok(changed)
    }
}

fn flatten(
    spec: JobSpec,
    parent: Option<usize>,
    tree_id: &str,
    now: u64,
    jobs: &mut Vec<Job>,
    parents: &mut Vec<Option<usize>>,
) -> usize {
    let JobSpec {
        job_type,
        context,
        required,
        timeout,
        mode,
        children,
    } = spec;

    let index = jobs.len();
    jobs.push(Job {
        id: job_id(tree_id, index),
        job_type,
        children: Vec::new(),
        mode,
        state: JobState::New,
        context,
        timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        logs: Vec::new(),
        required,
        failure: None,
        attempts: 0,
        handled: false,
        created_at: now,
        updated_at: now,
    });
    parents.push(parent);

    let child_ids = children
        .into_iter()
        .map(|child| {
            let child_index = flatten(child, Some(index), tree_id, now, jobs, parents);
            job_id(tree_id, child_index)
        })
        .collect();
    jobs[index].children = child_ids;
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> JobTree {
        let root = JobSpec::new("switch")
            .param("application_id", "shop")
            .sequential(vec![
                JobSpec::new("startup").parallel(vec![
                    JobSpec::new("start").param("node_id", "n1"),
                    JobSpec::new("start").param("node_id", "n2"),
                ]),
                JobSpec::new("flip"),
                JobSpec::new("cleanup").optional(),
            ]);
        JobTree::build_with_id("t1", "switch", BTreeMap::new(), root)
    }

    #[test]
    fn build_assigns_preorder_ids() {
        let tree = sample_tree();
        let ids: Vec<&str> = tree.jobs().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["t1:0", "t1:1", "t1:2", "t1:3", "t1:4", "t1:5"]);

        assert_eq!(tree.root().children, vec!["t1:1", "t1:4", "t1:5"]);
        assert_eq!(tree.job("t1:1").unwrap().children, vec!["t1:2", "t1:3"]);
        assert_eq!(tree.parent_of("t1:3").unwrap().id, "t1:1");
        assert!(tree.parent_of("t1:0").is_none());
        assert_eq!(tree.root().mode, ExecutionMode::Sequential);
        assert!(!tree.job("t1:5").unwrap().required);
    }

    #[test]
    fn every_job_starts_new() {
        let tree = sample_tree();
        assert!(tree.jobs().all(|j| j.state == JobState::New));
        assert_eq!(tree.state(), JobState::New);
        assert_eq!(tree.state_of("t1:4"), Some(JobState::New));
        assert_eq!(tree.state_of("t1:99"), None);
        assert_eq!(tree.state_of("other:1"), None);
    }

    #[test]
    fn root_is_always_required() {
        let tree = JobTree::build("x", BTreeMap::new(), JobSpec::new("noop").optional());
        assert!(tree.root().required);
    }

    #[test]
    fn effective_context_layers_ancestors() {
        let mut tree = sample_tree();
        tree.job_mut("t1:1")
            .unwrap()
            .context
            .insert("version_id".into(), "v2".into());

        let ctx = tree.effective_context("t1:2").unwrap();
        assert_eq!(ctx["application_id"], "shop");
        assert_eq!(ctx["version_id"], "v2");
        assert_eq!(ctx["node_id"], "n1");
    }

    #[test]
    fn descendants_and_leaves() {
        let tree = sample_tree();
        assert_eq!(tree.descendants("t1:1"), vec!["t1:2", "t1:3"]);
        assert_eq!(tree.descendants("t1:0").len(), 5);
        let leaves: Vec<&str> = tree.leaves().iter().map(|j| j.id.as_str()).collect();
        assert_eq!(leaves, vec!["t1:2", "t1:3", "t1:4", "t1:5"]);
    }

    #[test]
    fn abort_subtree_skips_terminal_jobs() {
        let mut tree = sample_tree();
        tree.set_state("t1:2", JobState::Success).unwrap();
        tree.set_state("t1:3", JobState::Running).unwrap();

        let marked = tree.abort_subtree("t1:0").unwrap();

        assert!(!marked.contains(&"t1:2".to_string()));
        assert_eq!(tree.state_of("t1:2"), Some(JobState::Success));
        assert_eq!(tree.state_of("t1:3"), Some(JobState::Aborted));
        assert_eq!(tree.state_of("t1:5"), Some(JobState::Aborted));
        assert_eq!(tree.state(), JobState::Aborted);
        assert_eq!(marked.len(), 5);
    }

    #[test]
    fn set_state_never_leaves_terminal() {
        let mut tree = sample_tree();
        tree.set_state("t1:4", JobState::Aborted).unwrap();
        let after = tree.set_state("t1:4", JobState::Success).unwrap();
        assert_eq!(after, JobState::Aborted);
    }

    #[test]
    fn reset_failed_reopens_failed_ancestors_only() {
        let mut tree = sample_tree();
        tree.set_state("t1:2", JobState::Success).unwrap();
        tree.set_state("t1:3", JobState::Failed).unwrap();
        tree.set_state("t1:1", JobState::Failed).unwrap();
        tree.set_state("t1:0", JobState::Failed).unwrap();

        let changed = tree.reset_failed("t1:3").unwrap();

        assert_eq!(changed, vec!["t1:3", "t1:1", "t1:0"]);
        assert_eq!(tree.state_of("t1:3"), Some(JobState::Ready));
        assert_eq!(tree.state_of("t1:2"), Some(JobState::Success));
        assert_eq!(tree.state_of("t1:4"), Some(JobState::New));
        assert!(tree.job("t1:2").unwrap().logs.is_empty());
    }

    #[test]
    fn settled_ancestor_finds_first_non_failed_parent() {
        let mut tree = sample_tree();
        tree.set_state("t1:3", JobState::Failed).unwrap();
        tree.set_state("t1:1", JobState::Failed).unwrap();
        assert_eq!(tree.settled_ancestor("t1:3").unwrap().id, "t1:0");

        tree.set_state("t1:0", JobState::Failed).unwrap();
        assert!(tree.settled_ancestor("t1:3").is_none());

        tree.set_state("t1:5", JobState::Failed).unwrap();
        assert!(tree.settled_ancestor("t1:5").is_none());
        assert!(tree.settled_ancestor("t1:0").is_none());
    }

    #[test]
    fn oversized_timeout_saturates() {
        let tree = JobTree::build(
            "x",
            BTreeMap::new(),
            JobSpec::new("slow").timeout(Duration::MAX),
        );
        assert_eq!(tree.root().timeout_ms, Some(u64::MAX));
        assert_eq!(tree.root().timeout(), Some(Duration::from_millis(u64::MAX)));
    }

    #[test]
    fn persisted_tree_keeps_progress() {
        let mut tree = sample_tree();
        tree.set_state("t1:2", JobState::Success).unwrap();
        tree.append_log("t1:2", "started on n1").unwrap();

        let back = JobTree::from_bytes(&tree.to_bytes().unwrap()).unwrap();

        assert_eq!(back, tree);
        assert_eq!(back.job("t1:2").unwrap().logs, vec!["started on n1"]);
    }

    #[test]
    fn from_bytes_rejects_inconsistent_links() {
        let tree = sample_tree();
        let mut value = serde_json::to_value(&tree).unwrap();
        value["parents"] = serde_json::json!([null]);
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            JobTree::from_bytes(&bytes),
            Err(TreeError::Malformed(_))
        ));
        assert!(matches!(
            JobTree::from_bytes(b"not json"),
            Err(TreeError::Decode(_))
        ));
    }

    #[test]
    fn log_replay_is_prefixed_and_ordered() {
        let mut tree = sample_tree();
        tree.append_log("t1:0", "begin").unwrap();
        tree.append_log("t1:3", "node n2 answered").unwrap();
        tree.append_log("t1:0", "end").unwrap();

        assert_eq!(
            tree.log_replay(),
            vec![
                "[t1:0 switch] begin",
                "[t1:0 switch] end",
                "[t1:3 start] node n2 answered",
            ]
        );
    }

    #[test]
    fn tree_id_is_recovered_from_job_id() {
        let tree = JobTree::build("startup", BTreeMap::new(), JobSpec::new("start"));
        assert_eq!(tree_id_of(tree.root_id()), Some(tree.id()));
        assert_eq!(tree_id_of("nocolon"), None);
    }
}
