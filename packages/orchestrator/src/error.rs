//! Error taxonomy for the orchestration layer.
//!
//! Only conditions that callers branch on get a variant here. A missing job
//! on a read path is `Option::None`, a cancel race is a `bool`; handler
//! failures travel as plain `anyhow::Error` and are classified at the
//! worker's retry decision.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A state transition referenced a job id with no record behind it.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The job store cannot be reached. Fatal during manager startup.
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    /// The job names a task no handler is registered for. Never retried.
    #[error("unknown task '{0}'")]
    UnknownTask(String),
}
