//! In-process job store backend.
//!
//! All queue state lives behind a single async mutex, which is also what
//! makes `get_next_job` atomic: a queued id exists in exactly one structure
//! at a time, and only the holder of the lock can move it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeadLetterEntry, FailureKind, JobStore, QueueStats, RetryPolicy};
use crate::error::OrchestratorError;
use crate::record::{JobRecord, JobStatus};

#[derive(Debug, Clone)]
struct DelayedJob {
    ready_at: DateTime<Utc>,
    id: Uuid,
}

#[derive(Debug, Clone)]
struct DeadLetter {
    job_id: Uuid,
    reason: String,
    dead_lettered_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    /// Ready priority-0 jobs, oldest first.
    fifo: VecDeque<Uuid>,
    /// Ready prioritized jobs, keyed by priority, oldest first per lane.
    priority: BTreeMap<i32, VecDeque<Uuid>>,
    /// Queued jobs still inside their backoff window.
    delayed: Vec<DelayedJob>,
    /// job id -> owning worker id.
    running: HashMap<Uuid, String>,
    /// worker id -> liveness marker expiry.
    worker_liveness: HashMap<String, DateTime<Utc>>,
    dead_letters: Vec<DeadLetter>,
}

impl Inner {
    fn enqueue(&mut self, job: &JobRecord) {
        if job.priority > 0 {
            self.priority.entry(job.priority).or_default().push_back(job.id);
        } else {
            self.fifo.push_back(job.id);
        }
    }

    fn remove_queued(&mut self, id: Uuid) {
        self.fifo.retain(|queued| *queued != id);
        for lane in self.priority.values_mut() {
            lane.retain(|queued| *queued != id);
        }
        self.priority.retain(|_, lane| !lane.is_empty());
        self.delayed.retain(|entry| entry.id != id);
    }

    /// Move delayed jobs whose backoff window has passed into the queues,
    /// oldest deadline first.
    fn promote_ready(&mut self, now: DateTime<Utc>) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|entry| entry.ready_at);
        let split = self.delayed.partition_point(|entry| entry.ready_at <= now);
        let ready: Vec<DelayedJob> = self.delayed.drain(..split).collect();
        for entry in ready {
            if let Some(job) = self.jobs.get(&entry.id).cloned() {
                if job.status == JobStatus::Queued {
                    self.enqueue(&job);
                }
            }
        }
    }

    fn pop_ready(&mut self) -> Option<Uuid> {
        // Highest priority lane first, FIFO within it.
        if let Some(mut lane) = self.priority.last_entry() {
            let id = lane.get_mut().pop_front();
            if lane.get().is_empty() {
                lane.remove();
            }
            if id.is_some() {
                return id;
            }
        }
        self.fifo.pop_front()
    }
}

pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    retry: RetryPolicy,
    liveness_ttl: Duration,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retry,
            liveness_ttl: Duration::from_secs(60),
        }
    }

    pub fn with_liveness_ttl(mut self, ttl: Duration) -> Self {
        self.liveness_ttl = ttl;
        self
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn connect(&self) -> Result<()> {
        debug!("memory job store ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn add_job(&self, job: JobRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if job.status == JobStatus::Queued {
            inner.enqueue(&job);
        }
        debug!(job_id = %job.id, task = %job.task_name, priority = job.priority, "job added");
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: JobRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_next_job(&self) -> Result<Option<Uuid>> {
        let mut inner = self.inner.lock().await;
        inner.promote_ready(Utc::now());
        Ok(inner.pop_ready())
    }

    async fn mark_running(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let inner = &mut *self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if job.status.is_terminal() {
            // Lost a race with cancel; the caller should skip the job.
            bail!("job {id} already {}, not claiming", job.status);
        }
        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.last_heartbeat = Some(now);
        job.worker_id = Some(worker_id.to_string());
        inner.running.insert(id, worker_id.to_string());
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid, result: Value) -> Result<()> {
        let inner = &mut *self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if job.status.is_terminal() {
            debug!(job_id = %id, status = %job.status, "completion ignored for terminal job");
            return Ok(());
        }
        job.status = JobStatus::Completed;
        job.finished_at = Some(Utc::now());
        job.result = Some(result);
        inner.running.remove(&id);
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        should_retry: bool,
        kind: FailureKind,
    ) -> Result<()> {
        let inner = &mut *self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Err(OrchestratorError::NotFound(id).into());
        };
        if job.status.is_terminal() {
            debug!(job_id = %id, status = %job.status, "failure ignored for terminal job");
            return Ok(());
        }

        job.retry_count += 1;
        job.error = Some(error.to_string());

        if should_retry && job.retry_count < job.max_retries {
            let delay = self.retry.delay_for(job.retry_count);
            let ready_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            job.status = JobStatus::Queued;
            job.started_at = None;
            job.finished_at = None;
            job.last_heartbeat = None;
            job.worker_id = None;
            job.not_ready_until = Some(ready_at);
            info!(
                job_id = %id,
                retry_count = job.retry_count,
                delay_secs = delay.as_secs(),
                "job requeued for retry"
            );
            inner.delayed.push(DelayedJob { ready_at, id });
        } else {
            job.status = match kind {
                FailureKind::Error => JobStatus::Failed,
                FailureKind::Timeout => JobStatus::TimedOut,
            };
            job.finished_at = Some(Utc::now());
            let reason = if should_retry {
                "max retries exceeded".to_string()
            } else {
                format!("non-retryable: {error}")
            };
            warn!(job_id = %id, status = %job.status, reason = %reason, "job dead lettered");
            inner.dead_letters.push(DeadLetter {
                job_id: id,
                reason,
                dead_lettered_at: Utc::now(),
            });
        }
        inner.running.remove(&id);
        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> Result<()> {
        let inner = &mut *self.inner.lock().await;
        let Some(job) = inner.jobs.get(&id).cloned() else {
            return Ok(());
        };
        if job.status != JobStatus::Queued {
            return Ok(());
        }
        // Guard against duplicates if the id never left the queues.
        inner.remove_queued(id);
        match job.not_ready_until {
            Some(ready_at) if ready_at > Utc::now() => {
                inner.delayed.push(DelayedJob { ready_at, id });
            }
            _ => inner.enqueue(&job),
        }
        debug!(job_id = %id, "job returned to queue");
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let inner = &mut *self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(Utc::now());
        inner.running.remove(&id);
        inner.remove_queued(id);
        info!(job_id = %id, "job cancelled");
        Ok(true)
    }

    async fn update_heartbeat(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let inner = &mut *self.inner.lock().await;
        let now = Utc::now();
        let running = match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.last_heartbeat = Some(now);
                true
            }
            _ => false,
        };
        // The liveness marker only counts heartbeats for jobs actually
        // running; a heartbeat against a queued or terminal job is a no-op.
        if running {
            let expiry = now
                + chrono::Duration::from_std(self.liveness_ttl)
                    .unwrap_or(chrono::Duration::zero());
            inner.worker_liveness.insert(worker_id.to_string(), expiry);
        }
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<Vec<Uuid>> {
        let inner = &mut *self.inner.lock().await;
        let now = Utc::now();
        let running: Vec<Uuid> = inner.running.keys().copied().collect();
        let mut expired = Vec::new();

        for id in running {
            match inner.jobs.get_mut(&id) {
                None => {
                    warn!(job_id = %id, "running set entry has no record, dropping");
                    inner.running.remove(&id);
                }
                Some(job) if job.is_expired(now) => {
                    job.status = JobStatus::TimedOut;
                    job.finished_at = Some(now);
                    job.error = Some(format!(
                        "job timed out after {} seconds",
                        job.timeout_seconds
                    ));
                    warn!(job_id = %id, timeout_seconds = job.timeout_seconds, "swept expired job");
                    inner.running.remove(&id);
                    expired.push(id);
                }
                Some(_) => {}
            }
        }
        Ok(expired)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        Ok(QueueStats {
            regular_queue_size: inner.fifo.len(),
            priority_queue_size: inner.priority.values().map(VecDeque::len).sum(),
            delayed_queue_size: inner.delayed.len(),
            running_count: inner.running.len(),
            dead_letter_count: inner.dead_letters.len(),
            live_workers: inner
                .worker_liveness
                .values()
                .filter(|expiry| **expiry > now)
                .count(),
        })
    }

    async fn list_running(&self) -> Result<Vec<JobRecord>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<JobRecord> = inner
            .running
            .keys()
            .filter_map(|id| inner.jobs.get(id))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        Ok(jobs)
    }

    async fn list_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dead_letters
            .iter()
            .rev()
            .take(limit)
            .filter_map(|entry| {
                inner.jobs.get(&entry.job_id).map(|job| DeadLetterEntry {
                    job: job.clone(),
                    reason: entry.reason.clone(),
                    dead_lettered_at: entry.dead_lettered_at,
                })
            })
            .collect())
    }

    async fn replay_dead_letter(&self, id: Uuid, reset_retries: bool) -> Result<Option<Uuid>> {
        let mut inner = self.inner.lock().await;
        let Some(position) = inner.dead_letters.iter().position(|e| e.job_id == id) else {
            return Ok(None);
        };
        let Some(original) = inner.jobs.get(&id).cloned() else {
            inner.dead_letters.remove(position);
            return Ok(None);
        };

        let replay = JobRecord::builder()
            .task_name(original.task_name.clone())
            .params(original.params.clone())
            .priority(original.priority)
            .max_retries(original.max_retries)
            .timeout_seconds(original.timeout_seconds)
            .retry_count(if reset_retries { 0 } else { original.retry_count })
            .build();
        let replay_id = replay.id;

        inner.dead_letters.remove(position);
        inner.enqueue(&replay);
        inner.jobs.insert(replay_id, replay);
        info!(job_id = %id, replay_id = %replay_id, "dead letter replayed");
        Ok(Some(replay_id))
    }
}
