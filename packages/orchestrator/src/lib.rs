//! Job orchestration for the scraping backend: a persistent priority job
//! queue and a supervised pool of workers executing registered tasks in
//! isolated resource scopes.
//!
//! # Architecture
//!
//! ```text
//! JobManager ──► JobStore (memory | postgres)
//!     │              ▲
//!     │ sweep loop   │ claim / heartbeat / outcomes
//!     ▼              │
//! WorkerPool ──► Worker (main loop + heartbeat loop)
//!     │              │
//!     │ supervisors  ├─► TaskRegistry (named async handlers)
//!     └─ restarts    └─► ScopeManager (per-job isolated runtimes)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let config = OrchestratorConfig::from_env()?;
//! let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
//!
//! let mut registry = TaskRegistry::new();
//! registry.register("scrape_listing", |ctx| async move {
//!     // drive ctx.scope, write to ctx.output_dir, watch ctx.cancel
//!     Ok(serde_json::json!({"pages": 3}))
//! });
//!
//! let manager = JobManager::new(Arc::clone(&store), config.sweep_interval);
//! manager.start().await?;
//!
//! let pool = WorkerPool::new(store, Arc::new(registry), provider, config.pool_config());
//! pool.start().await;
//!
//! let job_id = manager
//!     .submit(SubmitOptions::builder().task_name("scrape_listing").build())
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod record;
pub mod scope;
pub mod store;
pub mod tasks;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use manager::{JobManager, ManagerStats, RunningJobView, SubmitOptions};
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use record::{JobRecord, JobStatus};
pub use scope::{ResourceProvider, ResourceScope, ScopeManager, ScopeOptions};
pub use store::{
    DeadLetterEntry, FailureKind, JobStore, MemoryJobStore, PostgresJobStore, QueueStats,
    RetryPolicy,
};
pub use tasks::{TaskContext, TaskRegistry};
pub use worker::{Worker, WorkerConfig, WorkerStatus};
