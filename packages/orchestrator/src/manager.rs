//! Job manager: the submission and observation surface.
//!
//! The HTTP or CLI layer talks to this type only. It owns no workers; it
//! owns the store connection and the periodic sweep that times out
//! orphaned running jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::record::JobRecord;
use crate::store::{DeadLetterEntry, JobStore, QueueStats};

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SubmitOptions {
    pub task_name: String,
    #[builder(default = Value::Null)]
    pub params: Value,
    #[builder(default = 300)]
    pub timeout_seconds: i64,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
}

/// One running job as shown in stats output.
#[derive(Debug, Clone, Serialize)]
pub struct RunningJobView {
    pub job_id: Uuid,
    pub task_name: String,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<i64>,
    /// e.g. `running (42s elapsed)`.
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub queue: QueueStats,
    pub running: Vec<RunningJobView>,
}

pub struct JobManager {
    store: Arc<dyn JobStore>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, sweep_interval: Duration) -> Self {
        Self {
            store,
            sweep_interval,
            shutdown: CancellationToken::new(),
            sweep_handle: Mutex::new(None),
        }
    }

    /// Connect the store and spawn the sweep loop. A connection failure is
    /// fatal and propagates to the caller.
    pub async fn start(&self) -> Result<()> {
        self.store
            .connect()
            .await
            .context("job store connection failed at startup")?;

        let store = Arc::clone(&self.store);
        let token = self.shutdown.clone();
        let sweep_interval = self.sweep_interval;
        *self.sweep_handle.lock().await = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match store.sweep_expired().await {
                            Ok(expired) if !expired.is_empty() => {
                                info!(count = expired.len(), "swept expired jobs");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "sweep failed"),
                        }
                    }
                }
            }
        }));

        info!("job manager started");
        Ok(())
    }

    /// Stop the sweep loop and disconnect the store.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            let _ = handle.await;
        }
        if let Err(e) = self.store.disconnect().await {
            warn!(error = %e, "store disconnect failed");
        }
        info!("job manager stopped");
    }

    /// Create a queued job record and return its id.
    pub async fn submit(&self, options: SubmitOptions) -> Result<Uuid> {
        let job = JobRecord::builder()
            .task_name(options.task_name)
            .params(options.params)
            .timeout_seconds(options.timeout_seconds)
            .priority(options.priority)
            .max_retries(options.max_retries)
            .build();
        let id = job.id;
        info!(job_id = %id, task = %job.task_name, priority = job.priority, "job submitted");
        self.store.add_job(job).await?;
        Ok(id)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Option<JobRecord>> {
        self.store.get_job(id).await
    }

    /// Cancel a job. `false` means there was nothing to cancel (missing or
    /// already terminal); repeated calls are harmless.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        self.store.cancel(id).await
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        let queue = self.store.stats().await?;
        let now = Utc::now();
        let running = self
            .store
            .list_running()
            .await?
            .into_iter()
            .map(|job| RunningJobView {
                job_id: job.id,
                task_name: job.task_name.clone(),
                worker_id: job.worker_id.clone(),
                started_at: job.started_at,
                elapsed_seconds: job.elapsed_seconds(now),
                status: job.status_with_elapsed(now),
            })
            .collect();
        Ok(ManagerStats { queue, running })
    }

    pub async fn list_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.store.list_dead_letter(limit).await
    }

    /// Resubmit a dead-lettered job under a fresh id.
    pub async fn replay_dead_letter(&self, id: Uuid, reset_retries: bool) -> Result<Option<Uuid>> {
        self.store.replay_dead_letter(id, reset_retries).await
    }
}
