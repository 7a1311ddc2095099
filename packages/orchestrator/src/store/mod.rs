//! The job store seam: durable queue state behind an async trait.
//!
//! The store decides what "ready" means (priority, FIFO order, backoff
//! stamps); workers stay dumb and just ask for the next job. All transition
//! methods are safe under concurrent callers: `get_next_job` hands each
//! queued job to at most one caller.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::record::JobRecord;

/// Why a running job failed. Decides the terminal status when the retry
/// budget is exhausted: `Error` ends in `failed`, `Timeout` in `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Error,
    Timeout,
}

/// Exponential backoff schedule for retried jobs.
///
/// After the n-th failed attempt the delay is `min(base * 2^n, cap)`, so
/// the first retry already waits twice the base. The store stamps the
/// deadline on the record; nothing sleeps.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of failures so far.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let shift = retry_count.clamp(0, 31) as u32;
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Snapshot of queue depths and liveness counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Ready jobs in the plain FIFO lane (priority 0).
    pub regular_queue_size: usize,
    /// Ready jobs across all priority lanes.
    pub priority_queue_size: usize,
    /// Queued jobs still inside their backoff window.
    pub delayed_queue_size: usize,
    pub running_count: usize,
    pub dead_letter_count: usize,
    /// Workers with a fresh liveness marker.
    pub live_workers: usize,
}

/// A permanently failed job parked for inspection and replay.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub job: JobRecord,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Establish (or verify) connectivity. The manager treats a failure
    /// here as fatal.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Persist a new record and enqueue it if `Queued`.
    async fn add_job(&self, job: JobRecord) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>>;

    /// Overwrite the stored record. Idempotent.
    async fn update_job(&self, job: JobRecord) -> Result<()>;

    /// Pop the next ready job: highest priority first, FIFO within a
    /// priority, plain FIFO last. Jobs inside their backoff window are
    /// skipped. At most one caller receives any given id.
    async fn get_next_job(&self) -> Result<Option<Uuid>>;

    /// Transition to `Running` under `worker_id`. Errors with `NotFound`
    /// if the record is missing.
    async fn mark_running(&self, id: Uuid, worker_id: &str) -> Result<()>;

    /// Terminal success: store the result value.
    async fn mark_completed(&self, id: Uuid, result: Value) -> Result<()>;

    /// Record a failed attempt. Increments `retry_count`; if `should_retry`
    /// and budget remains, the job goes back to `Queued` with a backoff
    /// stamp, otherwise it lands terminal (`failed` or `timeout` per
    /// `kind`) and is appended to the dead letter queue.
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        should_retry: bool,
        kind: FailureKind,
    ) -> Result<()>;

    /// Return a dequeued-but-unclaimed job to the queue, respecting any
    /// backoff stamp. No-op unless the record is still `Queued`; workers
    /// call this when a store error interrupts a claim so the id is not
    /// stranded outside every queue.
    async fn requeue(&self, id: Uuid) -> Result<()>;

    /// Cancel a queued or running job. Returns `false` if the job is
    /// missing or already terminal; repeated calls are harmless.
    async fn cancel(&self, id: Uuid) -> Result<bool>;

    /// Refresh the job's heartbeat and the worker's liveness marker.
    /// No-op unless the job is running.
    async fn update_heartbeat(&self, id: Uuid, worker_id: &str) -> Result<()>;

    /// Repair pass over the running set: drop entries with no record and
    /// move expired jobs to `timeout`. Returns the expired ids.
    async fn sweep_expired(&self) -> Result<Vec<Uuid>>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn list_running(&self) -> Result<Vec<JobRecord>>;

    /// Most recent dead letter entries, newest first.
    async fn list_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Resubmit a dead-lettered job as a fresh `Queued` record under a new
    /// id. Returns `None` if the id is not in the dead letter queue.
    async fn replay_dead_letter(&self, id: Uuid, reset_retries: bool) -> Result<Option<Uuid>>;
}
