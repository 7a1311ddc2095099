//! A single supervised worker: a main loop that claims and executes jobs,
//! and a heartbeat loop that reports liveness for the job it is holding.
//!
//! The main loop is the only writer of the current-job slot; the heartbeat
//! loop only reads it. One job failing, timing out or being cancelled never
//! takes the loop down: every outcome is reported to the store and the loop
//! moves on. A panic is the one thing that kills the loop task, and the
//! pool's supervisor handles that.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::record::JobRecord;
use crate::scope::{ResourceProvider, ScopeManager, ScopeOptions};
use crate::store::{FailureKind, JobStore};
use crate::tasks::{TaskContext, TaskRegistry};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait when the queue is empty.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Pause after an unexpected store error before polling again.
    pub error_backoff: Duration,
    /// Root for per-job output directories (`data_root/task_name/job_id`).
    pub data_root: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
            data_root: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone)]
struct CurrentJob {
    id: Uuid,
    task_name: String,
}

/// Point-in-time view of a worker, surfaced through pool stats.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub current_job_id: Option<Uuid>,
    pub current_task: Option<String>,
    pub active_scopes: usize,
    pub consecutive_failures: u32,
    pub started_at: DateTime<Utc>,
}

pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    tasks: Arc<TaskRegistry>,
    scopes: ScopeManager,
    config: WorkerConfig,
    current_job: RwLock<Option<CurrentJob>>,
    shutdown: CancellationToken,
    consecutive_failures: AtomicU32,
    started_at: DateTime<Utc>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn JobStore>,
        tasks: Arc<TaskRegistry>,
        provider: Arc<dyn ResourceProvider>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            store,
            tasks,
            scopes: ScopeManager::new(provider),
            config,
            current_job: RwLock::new(None),
            shutdown: CancellationToken::new(),
            consecutive_failures: AtomicU32::new(0),
            started_at: Utc::now(),
            heartbeat_handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token the pool's supervisor uses to tell an intentional stop from
    /// a crash.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the heartbeat loop and the main loop. The returned handle is
    /// the main loop's; the caller (pool supervisor or test) awaits it.
    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let heartbeat = tokio::spawn(Arc::clone(self).heartbeat_loop());
        *self.heartbeat_handle.lock().await = Some(heartbeat);
        tokio::spawn(Arc::clone(self).run_loop())
    }

    /// Cancel both loops, cancel the in-flight job in the store, await the
    /// heartbeat loop and force-close any scopes still open. The main loop
    /// handle returned by `start` completes shortly after.
    pub async fn stop(&self) {
        info!(worker_id = %self.id, "stopping worker");
        self.shutdown.cancel();

        let current = self.current_job.read().await.clone();
        if let Some(current) = current {
            match self.store.cancel(current.id).await {
                Ok(_) => {}
                Err(e) => warn!(job_id = %current.id, error = %e, "failed to cancel in-flight job"),
            }
        }

        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.scopes.release_all().await;
    }

    pub async fn status(&self) -> WorkerStatus {
        let current = self.current_job.read().await.clone();
        WorkerStatus {
            worker_id: self.id.clone(),
            current_job_id: current.as_ref().map(|c| c.id),
            current_task: current.map(|c| c.task_name),
            active_scopes: self.scopes.active_count().await,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            started_at: self.started_at,
        }
    }

    async fn run_loop(self: Arc<Self>) {
        info!(worker_id = %self.id, "worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let job_id = match self.store.get_next_job().await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    if self.idle_wait(self.config.poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "failed to poll for jobs");
                    if self.idle_wait(self.config.error_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            let job = match self.store.get_job(job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(job_id = %job_id, "dequeued job has no record, skipping");
                    continue;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to load dequeued job");
                    // The id already left the queue; put it back so the
                    // job is not stranded.
                    self.release_claim(job_id).await;
                    if self.idle_wait(self.config.error_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = self.store.mark_running(job_id, &self.id).await {
                warn!(job_id = %job_id, error = %e, "could not claim job, skipping");
                self.release_claim(job_id).await;
                continue;
            }

            *self.current_job.write().await = Some(CurrentJob {
                id: job_id,
                task_name: job.task_name.clone(),
            });

            self.run_job(&job).await;

            *self.current_job.write().await = None;
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    /// Best-effort return of a popped id. `requeue` is a no-op for jobs
    /// that moved past `Queued`, so a cancel race cannot resurrect a job.
    async fn release_claim(&self, job_id: Uuid) {
        if let Err(e) = self.store.requeue(job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to return job to queue");
        }
    }

    /// Execute one claimed job under its deadline and report the outcome.
    async fn run_job(&self, job: &JobRecord) {
        let deadline = Duration::from_secs(job.timeout_seconds.max(0) as u64);
        let job_cancel = self.shutdown.child_token();
        let span = info_span!("job", job_id = %job.id, task = %job.task_name, worker_id = %self.id);

        let outcome = tokio::time::timeout(
            deadline,
            self.process_job(job, &job_cancel).instrument(span),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => {
                info!(job_id = %job.id, task = %job.task_name, "job completed");
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if let Err(e) = self.store.mark_completed(job.id, result).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job completed");
                }
            }
            Ok(Err(e)) => {
                let retryable = is_retryable(&e);
                warn!(job_id = %job.id, task = %job.task_name, error = %e, retryable, "job failed");
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                if let Err(mark_err) = self
                    .store
                    .mark_failed(job.id, &e.to_string(), retryable, FailureKind::Error)
                    .await
                {
                    error!(job_id = %job.id, error = %mark_err, "failed to mark job failed");
                }
            }
            Err(_) => {
                // Deadline expired: the job future was dropped mid-flight,
                // so its scope may still be registered.
                job_cancel.cancel();
                self.scopes.release(job.id).await;
                let message = format!("job timed out after {} seconds", job.timeout_seconds);
                warn!(job_id = %job.id, timeout_seconds = job.timeout_seconds, "job deadline expired");
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self
                    .store
                    .mark_failed(job.id, &message, true, FailureKind::Timeout)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "failed to mark job timed out");
                }
            }
        }
    }

    async fn process_job(&self, job: &JobRecord, cancel: &CancellationToken) -> Result<Value> {
        if !self.tasks.is_registered(&job.task_name) {
            return Err(OrchestratorError::UnknownTask(job.task_name.clone()).into());
        }

        let output_dir = self
            .config
            .data_root
            .join(&job.task_name)
            .join(job.id.to_string());
        tokio::fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("creating output dir {}", output_dir.display()))?;

        let scope = self
            .scopes
            .acquire(job.id, &ScopeOptions::from_params(&job.params))
            .await?;

        let ctx = TaskContext {
            job_id: job.id,
            params: job.params.clone(),
            scope,
            output_dir,
            cancel: cancel.clone(),
        };

        let result = tokio::select! {
            result = self.tasks.execute(&job.task_name, ctx) => result,
            _ = cancel.cancelled() => Err(anyhow!("job cancelled during execution")),
        };

        self.scopes.release(job.id).await;
        result
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        // The first tick of an interval is immediate; skip it so heartbeats
        // start one interval in.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let current = self.current_job.read().await.as_ref().map(|c| c.id);
                    if let Some(job_id) = current {
                        if let Err(e) = self.store.update_heartbeat(job_id, &self.id).await {
                            warn!(worker_id = %self.id, job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        }
    }

    /// Wait out an idle or backoff period, returning early (and `true`)
    /// on shutdown.
    async fn idle_wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.cancelled() => true,
        }
    }
}

/// Unknown tasks can never succeed; everything else (network errors,
/// handler failures, flaky pages) is worth retrying.
fn is_retryable(error: &anyhow::Error) -> bool {
    !matches!(
        error.downcast_ref::<OrchestratorError>(),
        Some(OrchestratorError::UnknownTask(_))
    )
}
