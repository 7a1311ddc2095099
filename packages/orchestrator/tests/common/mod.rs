#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use orchestrator::{
    JobRecord, JobStatus, JobStore, ResourceProvider, ResourceScope, ScopeOptions, WorkerConfig,
};
use uuid::Uuid;

/// Set `RUST_LOG=orchestrator=debug` to see store and worker activity
/// while a test runs.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Provider that counts scope creations and closes so tests can assert
/// acquire/release balance.
pub struct TrackingProvider {
    creates: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

struct TrackingScope {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ResourceScope for TrackingScope {
    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ResourceProvider for TrackingProvider {
    async fn create(
        &self,
        _job_id: Uuid,
        _options: &ScopeOptions,
    ) -> Result<Arc<dyn ResourceScope>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TrackingScope {
            closes: Arc::clone(&self.closes),
        }))
    }
}

impl TrackingProvider {
    pub fn new() -> (Arc<Self>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let creates = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(Self {
            creates: Arc::clone(&creates),
            closes: Arc::clone(&closes),
        });
        (provider, creates, closes)
    }
}

pub fn fast_worker_config(data_root: &Path) -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(50),
        error_backoff: Duration::from_millis(10),
        data_root: data_root.to_path_buf(),
    }
}

/// Poll until the job reaches `status`, panicking after `timeout`.
pub async fn wait_for_status(
    store: &Arc<dyn JobStore>,
    id: Uuid,
    status: JobStatus,
    timeout: Duration,
) -> JobRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get_job(id).await.unwrap();
        if let Some(job) = &job {
            if job.status == status {
                return job.clone();
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {status:?}, last seen: {job:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the job is in any terminal status.
pub async fn wait_for_terminal(
    store: &Arc<dyn JobStore>,
    id: Uuid,
    timeout: Duration,
) -> JobRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get_job(id).await.unwrap();
        if let Some(job) = &job {
            if job.status.is_terminal() {
                return job.clone();
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for a terminal status, last seen: {job:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
