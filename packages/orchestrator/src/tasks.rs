//! Task registry: maps task names to async handlers.
//!
//! Handlers are registered once at startup and invoked by workers with a
//! fully prepared `TaskContext`. A handler returns the job's result value
//! or an error; retry classification happens in the worker.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::scope::ResourceScope;

/// Everything a handler needs to execute one job.
pub struct TaskContext {
    pub job_id: Uuid,
    pub params: Value,
    /// The isolated runtime for this job. Released by the worker after the
    /// handler returns; handlers must not close it themselves.
    pub scope: Arc<dyn ResourceScope>,
    /// Per-job directory (`data_root/task_name/job_id`), created before
    /// the handler runs.
    pub output_dir: PathBuf,
    /// Cancelled when the job or the worker is being stopped. Long-running
    /// handlers should check it at convenient points.
    pub cancel: CancellationToken,
}

type BoxedTask =
    Box<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, BoxedTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a task name. Later registrations replace
    /// earlier ones.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.tasks
            .insert(name.into(), Box::new(move |ctx| Box::pin(handler(ctx))));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    /// Invoke the handler for `name`. An unregistered name is an
    /// `UnknownTask` error, which workers treat as non-retryable.
    pub async fn execute(&self, name: &str, ctx: TaskContext) -> Result<Value> {
        let handler = self
            .tasks
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownTask(name.to_string()))?;
        handler(ctx).await
    }
}
