//! Job executor: drives job trees to a terminal state.
//!
//! ```text
//!   run / spawn / resume
//!          │
//!          ▼
//!   ┌──────────────┐  save_tree / update_job_state / append_log
//!   │   Executor   │ ─────────────────────────────────────────► JobRecordStore
//!   └──────┬───────┘
//!          │ drive(root)
//!          ▼
//!   NEW ─► READY ─► RUNNING ─► handler (bounded remote retry, timeout)
//!                      │
//!                      ├─ sequential children: in order, stop at first required failure
//!                      └─ parallel children: join_all, siblings never cancelled
//!                      ▼
//!               SUCCESS | FAILED (aggregated root causes) | ABORTED
//! ```
//!
//! Every state change of a live tree is applied under the tree's lock and
//! written through to the store before the lock is released, so the
//! persisted copy never runs behind or ahead of the live one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, join_all};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use stratus_core::{ExecutorConfig, TreeId};

use crate::error::{ExecError, ExecResult, JobError, StoreResult, TreeError};
use crate::handler::{HandlerOutput, HandlerRegistry, JobContext, JobHandler};
use crate::store::JobRecordStore;
use crate::tree::{ExecutionMode, FailureKind, JobFailure, JobId, JobState, JobTree};

/// Tunables for the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorOptions {
    /// Attempts made for a handler that keeps failing with a transient
    /// remote error.
    pub remote_retry_limit: u32,
    pub retry_backoff: Duration,
    /// Applied to jobs without a timeout of their own.
    pub default_timeout: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for ExecutorOptions {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            remote_retry_limit: config.remote_retry_limit.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            default_timeout: config.default_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Final result of driving a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeOutcome {
    pub tree_id: TreeId,
    pub state: JobState,
    /// The root's failure. The only failure surfaced to callers; details
    /// stay on the tree.
    pub failure: Option<JobFailure>,
}

impl TreeOutcome {
    pub fn of(tree: &JobTree) -> Self {
        Self {
            tree_id: tree.id().to_string(),
            state: tree.state(),
            failure: tree.root_failure().cloned(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == JobState::Success
    }
}

/// Drives job trees. Cheap to clone; clones share the live-tree table.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn JobRecordStore>,
    handlers: Arc<HandlerRegistry>,
    options: ExecutorOptions,
    live: Arc<tokio::sync::Mutex<HashMap<TreeId, Arc<Run>>>>,
}

impl Executor {
    pub fn new(store: Arc<dyn JobRecordStore>, handlers: HandlerRegistry) -> Self {
        Self {
            store,
            handlers: Arc::new(handlers),
            options: ExecutorOptions::default(),
            live: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn JobRecordStore> {
        &self.store
    }

    /// Persist `tree` and drive it to a terminal state.
    pub async fn run(&self, tree: JobTree) -> ExecResult<TreeOutcome> {
        let run = self.register(tree).await?;
        self.finish(run).await
    }

    /// Persist `tree` and drive it on a background task.
    ///
    /// The tree is live (and abortable) once this returns.
    pub async fn spawn(&self, tree: JobTree) -> ExecResult<JoinHandle<ExecResult<TreeOutcome>>> {
        let run = self.register(tree).await?;
        let executor = self.clone();
        Ok(tokio::spawn(async move { executor.finish(run).await }))
    }

    /// Load a persisted tree and drive it again. Finished work is skipped.
    pub async fn resume(&self, tree_id: &str) -> ExecResult<TreeOutcome> {
        let tree = self.store.load_tree(tree_id)?;
        if tree.is_terminal() {
            debug!(tree = %tree_id, state = %tree.state(), "tree already terminal, nothing to resume");
            return Ok(TreeOutcome::of(&tree));
        }
        info!(tree = %tree_id, kind = tree.kind(), "resuming job tree");
        self.run(tree).await
    }

    /// Resume every persisted tree whose root is not terminal.
    ///
    /// Trees that cannot be loaded or driven are logged and skipped.
    pub async fn recover(&self) -> ExecResult<Vec<TreeOutcome>> {
        let mut pending = Vec::new();
        for tree_id in self.store.list_trees()? {
            match self.store.load_tree(&tree_id) {
                Ok(tree) if !tree.is_terminal() => pending.push(tree),
                Ok(_) => {}
                Err(e) => error!(tree = %tree_id, error = %e, "skipping unreadable job tree"),
            }
        }
        info!(count = pending.len(), "recovering interrupted job trees");

        let results = join_all(pending.into_iter().map(|tree| self.run(tree))).await;
        let mut outcomes = Vec::new();
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "job tree recovery failed"),
            }
        }
        Ok(outcomes)
    }

    /// Reset a failed leaf to `READY` so the next [`resume`](Self::resume)
    /// runs it again. Siblings and their logs are untouched.
    ///
    /// Every ancestor must be `FAILED` too; a leaf under a finished
    /// success or an aborted job could never be reached again.
    pub async fn retry(&self, tree_id: &str, job_id: &str) -> ExecResult<()> {
        if self.is_live(tree_id).await {
            return Err(ExecError::AlreadyRunning(tree_id.to_string()));
        }
        let mut tree = self.store.load_tree(tree_id)?;
        let job = tree
            .job(job_id)
            .ok_or_else(|| TreeError::UnknownJob(job_id.to_string()))?;
        if !job.is_leaf() {
            return Err(ExecError::NotLeaf(job_id.to_string()));
        }
        if job.state != JobState::Failed {
            return Err(ExecError::NotRetryable {
                job: job_id.to_string(),
                state: job.state,
            });
        }
        if let Some(ancestor) = tree.settled_ancestor(job_id) {
            return Err(ExecError::SettledAncestor {
                job: job_id.to_string(),
                ancestor: ancestor.id.clone(),
                state: ancestor.state,
            });
        }

        let changed = tree.reset_failed(job_id)?;
        self.store.save_tree(&tree)?;
        info!(tree = %tree_id, job = %job_id, reopened = changed.len(), "job reset for retry");
        Ok(())
    }

    /// Abort `job_id` and every non-terminal descendant.
    ///
    /// Works on live trees (running handlers see it at their next
    /// checkpoint) and on persisted ones. Returns the ids that changed.
    pub async fn abort(&self, tree_id: &str, job_id: &str) -> ExecResult<Vec<JobId>> {
        let live = self.live.lock().await.get(tree_id).cloned();
        let marked = match live {
            Some(run) => run.abort(job_id)?,
            None => {
                let mut tree = self.store.load_tree(tree_id)?;
                let marked = tree.abort_subtree(job_id)?;
                self.store.save_tree(&tree)?;
                marked
            }
        };
        info!(tree = %tree_id, job = %job_id, aborted = marked.len(), "abort applied");
        Ok(marked)
    }

    /// Current snapshot of a tree, live or persisted.
    pub async fn tree(&self, tree_id: &str) -> ExecResult<JobTree> {
        if let Some(run) = self.live.lock().await.get(tree_id) {
            return Ok(run.snapshot());
        }
        Ok(self.store.load_tree(tree_id)?)
    }

    pub async fn is_live(&self, tree_id: &str) -> bool {
        self.live.lock().await.contains_key(tree_id)
    }

    async fn register(&self, tree: JobTree) -> ExecResult<Arc<Run>> {
        let mut live = self.live.lock().await;
        if live.contains_key(tree.id()) {
            return Err(ExecError::AlreadyRunning(tree.id().to_string()));
        }
        self.store.save_tree(&tree)?;

        let already_aborted: HashSet<JobId> = tree
            .jobs()
            .filter(|j| j.state == JobState::Aborted)
            .map(|j| j.id.clone())
            .collect();
        let (aborted, _) = watch::channel(already_aborted);
        let run = Arc::new(Run {
            tree_id: tree.id().to_string(),
            root_id: tree.root_id().to_string(),
            tree: Mutex::new(tree),
            aborted,
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            options: self.options.clone(),
        });
        live.insert(run.tree_id.clone(), run.clone());
        Ok(run)
    }

    async fn finish(&self, run: Arc<Run>) -> ExecResult<TreeOutcome> {
        debug!(tree = %run.tree_id, "driving job tree");
        let driven = run.clone().drive(run.root_id.clone()).await;

        let snapshot = run.snapshot();
        let saved = self.store.save_tree(&snapshot);
        self.live.lock().await.remove(&run.tree_id);
        driven?;
        saved?;

        let outcome = TreeOutcome::of(&snapshot);
        match &outcome.failure {
            None => info!(tree = %outcome.tree_id, state = %outcome.state, "job tree finished"),
            Some(failure) => warn!(
                tree = %outcome.tree_id,
                state = %outcome.state,
                failed_jobs = ?failure.failed_jobs,
                "job tree failed: {}",
                failure.message
            ),
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("handlers", &self.handlers)
            .field("options", &self.options)
            .finish()
    }
}

/// What `drive` needs to know about a job before running it.
struct Step {
    state: JobState,
    job_type: String,
    mode: ExecutionMode,
    /// (child id, required)
    children: Vec<(JobId, bool)>,
    handled: bool,
    timeout: Option<Duration>,
}

/// One live tree and everything needed to drive it.
struct Run {
    tree_id: TreeId,
    root_id: JobId,
    tree: Mutex<JobTree>,
    aborted: watch::Sender<HashSet<JobId>>,
    store: Arc<dyn JobRecordStore>,
    handlers: Arc<HandlerRegistry>,
    options: ExecutorOptions,
}

impl Run {
    fn drive(self: Arc<Self>, id: JobId) -> BoxFuture<'static, Result<JobState, TreeError>> {
        async move {
            let step = self.step(&id)?;
            if step.state.is_terminal() {
                return Ok(step.state);
            }
            if step.state == JobState::New {
                self.transition(&id, JobState::Ready)?;
            }
            let state = self.transition(&id, JobState::Running)?;
            if state != JobState::Running {
                return Ok(state);
            }
            if step.state == JobState::Running {
                self.log(&id, "resuming interrupted job")?;
            }

            if !step.handled {
                match self.handlers.get(&step.job_type) {
                    Some(handler) => match self.invoke(&id, handler, step.timeout).await? {
                        Ok(output) => {
                            if !self.complete_handler(&id, output)? {
                                return self.state(&id);
                            }
                        }
                        Err(err) => {
                            let failure = JobFailure {
                                kind: err.kind(),
                                message: err.to_string(),
                                failed_jobs: Vec::new(),
                            };
                            return self.fail(&id, failure);
                        }
                    },
                    None if step.children.is_empty() => {
                        let failure = JobFailure {
                            kind: FailureKind::Validation,
                            message: format!("no handler registered for job type {}", step.job_type),
                            failed_jobs: Vec::new(),
                        };
                        return self.fail(&id, failure);
                    }
                    None => {}
                }
            }

            match step.mode {
                ExecutionMode::Sequential => {
                    for (child, required) in &step.children {
                        let state = self.clone().drive(child.clone()).await?;
                        if state != JobState::Success && *required {
                            break;
                        }
                    }
                }
                ExecutionMode::Parallel => {
                    let children = step
                        .children
                        .iter()
                        .map(|(child, _)| self.clone().drive(child.clone()));
                    for result in join_all(children).await {
                        result?;
                    }
                }
            }

            self.settle(&id)
        }
        .boxed()
    }

    /// Invoke the handler with bounded retry of transient errors, all
    /// attempts together under the job's timeout.
    async fn invoke(
        &self,
        id: &str,
        handler: Arc<dyn JobHandler>,
        timeout: Option<Duration>,
    ) -> Result<Result<HandlerOutput, JobError>, TreeError> {
        match timeout.or(self.options.default_timeout) {
            Some(deadline) => match tokio::time::timeout(deadline, self.attempts(id, handler)).await {
                Ok(result) => result,
                Err(_) => Ok(Err(JobError::Timeout(deadline))),
            },
            None => self.attempts(id, handler).await,
        }
    }

    async fn attempts(
        &self,
        id: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Result<HandlerOutput, JobError>, TreeError> {
        let max_attempts = self.options.remote_retry_limit.max(1);
        let mut attempt = 1;
        loop {
            let ctx = self.begin_attempt(id, attempt, max_attempts)?;
            match handler.handle(ctx).await {
                Ok(output) => return Ok(Ok(output)),
                Err(err) if err.is_transient() && attempt < max_attempts && !self.is_aborted(id) => {
                    warn!(
                        tree = %self.tree_id,
                        job = %id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "transient job failure, retrying"
                    );
                    self.log(id, format!("attempt {attempt} failed: {err}; retrying"))?;
                    tokio::time::sleep(self.options.retry_backoff).await;
                    attempt += 1;
                }
                Err(err) => return Ok(Err(err)),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobTree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> JobTree {
        self.lock().clone()
    }

    fn state(&self, id: &str) -> Result<JobState, TreeError> {
        self.lock()
            .state_of(id)
            .ok_or_else(|| TreeError::UnknownJob(id.to_string()))
    }

    fn is_aborted(&self, id: &str) -> bool {
        self.aborted.borrow().contains(id)
    }

    fn step(&self, id: &str) -> Result<Step, TreeError> {
        let tree = self.lock();
        let job = tree
            .job(id)
            .ok_or_else(|| TreeError::UnknownJob(id.to_string()))?;
        let children = job
            .children
            .iter()
            .filter_map(|c| tree.job(c))
            .map(|c| (c.id.clone(), c.required))
            .collect();
        Ok(Step {
            state: job.state,
            job_type: job.job_type.clone(),
            mode: job.mode,
            children,
            handled: job.handled,
            timeout: job.timeout(),
        })
    }

    fn transition(&self, id: &str, state: JobState) -> Result<JobState, TreeError> {
        let mut tree = self.lock();
        let before = tree
            .state_of(id)
            .ok_or_else(|| TreeError::UnknownJob(id.to_string()))?;
        let after = tree.set_state(id, state)?;
        if after != before {
            debug!(tree = %self.tree_id, job = %id, from = %before, to = %after, "job transition");
            self.write(|store| store.update_job_state(id, after));
        }
        Ok(after)
    }

    fn log(&self, id: &str, line: impl Into<String>) -> Result<(), TreeError> {
        let line = line.into();
        let mut tree = self.lock();
        tree.append_log(id, line.clone())?;
        self.write(|store| store.append_log(id, &line));
        Ok(())
    }

    fn begin_attempt(&self, id: &str, attempt: u32, max_attempts: u32) -> Result<JobContext, TreeError> {
        let mut tree = self.lock();
        let params = tree
            .effective_context(id)
            .ok_or_else(|| TreeError::UnknownJob(id.to_string()))?;
        let job = tree.job_mut(id)?;
        job.attempts += 1;
        let job_type = job.job_type.clone();
        let line = format!("attempt {attempt}/{max_attempts}");
        tree.append_log(id, line.clone())?;
        self.write(|store| store.append_log(id, &line));

        Ok(JobContext::new(
            self.tree_id.clone(),
            id.to_string(),
            job_type,
            params,
            tree.labels().clone(),
            attempt,
            max_attempts,
            self.aborted.subscribe(),
        ))
    }

    /// Merge handler output into the job. Returns false when the job was
    /// aborted while the handler ran; the output is then dropped.
    fn complete_handler(&self, id: &str, output: HandlerOutput) -> Result<bool, TreeError> {
        let mut tree = self.lock();
        let job = tree.job_mut(id)?;
        if job.state.is_terminal() {
            job.logs
                .push("handler finished after abort, output discarded".to_string());
            self.write(|store| store.save_tree(&tree));
            return Ok(false);
        }
        job.context.extend(output.data);
        job.logs.extend(output.logs);
        job.handled = true;
        self.write(|store| store.save_tree(&tree));
        Ok(true)
    }

    fn fail(&self, id: &str, failure: JobFailure) -> Result<JobState, TreeError> {
        let mut tree = self.lock();
        let job = tree.job_mut(id)?;
        if job.state.is_terminal() {
            return Ok(job.state);
        }
        warn!(
            tree = %self.tree_id,
            job = %id,
            kind = ?failure.kind,
            "job failed: {}",
            failure.message
        );
        job.logs.push(format!("failed: {}", failure.message));
        job.state = JobState::Failed;
        job.failure = Some(failure);
        self.write(|store| store.save_tree(&tree));
        Ok(JobState::Failed)
    }

    /// Decide a job's final state from its children.
    fn settle(&self, id: &str) -> Result<JobState, TreeError> {
        let mut tree = self.lock();
        let job = tree
            .job(id)
            .ok_or_else(|| TreeError::UnknownJob(id.to_string()))?;
        if job.state.is_terminal() {
            return Ok(job.state);
        }

        let mut failed = Vec::new();
        let mut root_causes = Vec::new();
        let mut notes = Vec::new();
        for child in job.children.iter().filter_map(|c| tree.job(c)) {
            if !matches!(child.state, JobState::Failed | JobState::Aborted) {
                continue;
            }
            if !child.required {
                notes.push(format!("optional child {} ended {}", child.id, child.state));
                continue;
            }
            failed.push(child.id.clone());
            match &child.failure {
                Some(f) if !f.failed_jobs.is_empty() => root_causes.extend(f.failed_jobs.iter().cloned()),
                _ => root_causes.push(child.id.clone()),
            }
        }

        for note in notes {
            tree.append_log(id, note.clone())?;
            self.write(|store| store.append_log(id, &note));
        }

        if failed.is_empty() {
            drop(tree);
            return self.transition(id, JobState::Success);
        }

        let failure = JobFailure {
            kind: FailureKind::ChildFailed,
            message: format!("required children did not succeed: {}", failed.join(", ")),
            failed_jobs: root_causes,
        };
        drop(tree);
        self.fail(id, failure)
    }

    fn abort(&self, id: &str) -> Result<Vec<JobId>, TreeError> {
        let mut tree = self.lock();
        let marked = tree.abort_subtree(id)?;
        for job in &marked {
            self.write(|store| store.update_job_state(job, JobState::Aborted));
            self.write(|store| store.append_log(job, "aborted"));
        }
        drop(tree);
        self.aborted
            .send_modify(|set| set.extend(marked.iter().cloned()));
        Ok(marked)
    }

    /// Write through to the store. Failures are logged; the final save at
    /// the end of the run reports them to the caller.
    fn write(&self, f: impl FnOnce(&dyn JobRecordStore) -> StoreResult<()>) {
        if let Err(e) = f(&*self.store) {
            error!(tree = %self.tree_id, error = %e, "job record store write failed");
        }
    }
}
