//! Job handlers and the typed handler registry.
//!
//! A handler implements one job type. The registry maps type tags to
//! handlers; it is assembled once at startup and shared read-only with the
//! executor afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use stratus_core::TreeId;

use crate::error::JobError;
use crate::tree::{Context, JobId};

/// Executes one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, JobError>;
}

/// Everything a handler gets to see about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub tree_id: TreeId,
    pub job_id: JobId,
    pub job_type: String,
    /// Effective context: ancestors' entries overlaid by the job's own.
    pub params: Context,
    /// Labels of the owning tree.
    pub labels: BTreeMap<String, String>,
    /// 1-based attempt number within the current dispatch.
    pub attempt: u32,
    pub max_attempts: u32,
    aborted: watch::Receiver<HashSet<JobId>>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree_id: TreeId,
        job_id: JobId,
        job_type: String,
        params: Context,
        labels: BTreeMap<String, String>,
        attempt: u32,
        max_attempts: u32,
        aborted: watch::Receiver<HashSet<JobId>>,
    ) -> Self {
        Self {
            tree_id,
            job_id,
            job_type,
            params,
            labels,
            attempt,
            max_attempts,
            aborted,
        }
    }

    /// Required string parameter.
    pub fn str_param(&self, key: &str) -> Result<&str, JobError> {
        match self.params.get(key) {
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(other) => Err(JobError::Validation(format!(
                "parameter {key} must be a string, got {other}"
            ))),
            None => Err(JobError::Validation(format!("missing parameter {key}"))),
        }
    }

    /// Typed parameter; missing keys read as `None`.
    pub fn opt_param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, JobError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| JobError::Validation(format!("parameter {key}: {e}"))),
        }
    }

    /// Whether this attempt is the last one the executor will make.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.borrow().contains(&self.job_id)
    }

    /// Cooperative abort point. Long-running handlers call this between
    /// steps and return the error when the job has been aborted.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_aborted() {
            Err(JobError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Successful handler result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// Merged into the job's context, visible to its descendants.
    pub data: Context,
    /// Appended to the job's log.
    pub logs: Vec<String>,
}

impl HandlerOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }
}

/// Immutable map from job type tag to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any earlier one.
    pub fn with(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutput, JobError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, JobError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
