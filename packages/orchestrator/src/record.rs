//! Job records and the job status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Lifecycle status of a job.
///
/// Transitions:
/// - `Queued -> Running` (worker claims the job)
/// - `Running -> Completed | Failed | TimedOut` (execution outcome)
/// - `Running -> Queued` (retryable failure with budget remaining)
/// - `Queued | Running -> Cancelled` (explicit cancellation)
///
/// `Completed`, `Failed`, `Cancelled` and `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    #[sqlx(rename = "timeout")]
    #[serde(rename = "timeout")]
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timeout",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of scraping work and its full lifecycle state.
///
/// Records are created `Queued` by the manager and from then on mutated
/// only through store transitions. Timestamps are each set by exactly one
/// transition: `created_at` at submit, `started_at` at claim, `finished_at`
/// at a terminal transition, `last_heartbeat` by the heartbeat path.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRecord {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub task_name: String,
    #[builder(default = Value::Null)]
    pub params: Value,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub result: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    /// Per-job execution deadline enforced by the worker's bounded wait
    /// and by the sweeper for orphaned running jobs.
    #[builder(default = 300)]
    pub timeout_seconds: i64,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    /// Higher values are dequeued first; 0 is the plain FIFO lane.
    #[builder(default = 0)]
    pub priority: i32,
    /// Retry backoff stamp. A queued job is invisible to dequeue until
    /// this instant has passed.
    #[builder(default, setter(strip_option))]
    pub not_ready_until: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Whether a running job has outlived its deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started)) => {
                (now - started).num_seconds() > self.timeout_seconds
            }
            _ => false,
        }
    }

    /// Seconds spent running so far, if the job is running.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started)) => Some((now - started).num_seconds().max(0)),
            _ => None,
        }
    }

    /// Human-readable status line, e.g. `running (42s elapsed)`.
    pub fn status_with_elapsed(&self, now: DateTime<Utc>) -> String {
        match self.elapsed_seconds(now) {
            Some(secs) => format!("{} ({}s elapsed)", self.status, secs),
            None => self.status.to_string(),
        }
    }
}
