//! Worker pool with supervision.
//!
//! The pool owns a fixed roster of worker identities (`worker-0` through
//! `worker-{n-1}`). Each worker's main loop is awaited by a dedicated
//! supervisor task; if the loop ends without an intentional stop (panic or
//! unexpected return), the supervisor reports a crash and the health
//! monitor respawns a fresh worker under the same identity. The interval
//! pass of the health monitor is the backstop for anything the event path
//! misses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::scope::ResourceProvider;
use crate::store::JobStore;
use crate::tasks::TaskRegistry;
use crate::worker::{Worker, WorkerConfig, WorkerStatus};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// Cadence of the roster backstop check.
    pub health_interval: Duration,
    pub worker: WorkerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            health_interval: Duration::from_secs(30),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub worker_count: usize,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug)]
enum WorkerEvent {
    Crashed { worker_id: String },
}

struct WorkerHandle {
    worker: Arc<Worker>,
    supervisor: JoinHandle<()>,
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    tasks: Arc<TaskRegistry>,
    provider: Arc<dyn ResourceProvider>,
    config: PoolConfig,
    workers: RwLock<HashMap<String, WorkerHandle>>,
    shutdown: CancellationToken,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        tasks: Arc<TaskRegistry>,
        provider: Arc<dyn ResourceProvider>,
        config: PoolConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            tasks,
            provider,
            config,
            workers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            health_handle: Mutex::new(None),
        })
    }

    /// Spawn the full roster and the health monitor.
    pub async fn start(self: &Arc<Self>) {
        info!(max_workers = self.config.max_workers, "starting worker pool");
        for index in 0..self.config.max_workers {
            self.spawn_worker(format!("worker-{index}")).await;
        }
        if let Some(events_rx) = self.events_rx.lock().await.take() {
            let pool = Arc::clone(self);
            *self.health_handle.lock().await =
                Some(tokio::spawn(pool.health_monitor(events_rx)));
        }
    }

    /// Stop the health monitor, then every worker concurrently, then await
    /// their supervisors.
    pub async fn stop(&self) {
        info!("stopping worker pool");
        self.shutdown.cancel();
        if let Some(handle) = self.health_handle.lock().await.take() {
            let _ = handle.await;
        }

        let drained: Vec<WorkerHandle> = {
            let mut workers = self.workers.write().await;
            workers.drain().map(|(_, handle)| handle).collect()
        };
        futures::future::join_all(drained.iter().map(|handle| handle.worker.stop())).await;
        for handle in drained {
            let _ = handle.supervisor.await;
        }
        info!("worker pool stopped");
    }

    pub async fn stats(&self) -> PoolStats {
        let workers = self.workers.read().await;
        let mut statuses = Vec::with_capacity(workers.len());
        for handle in workers.values() {
            statuses.push(handle.worker.status().await);
        }
        statuses.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        PoolStats {
            max_workers: self.config.max_workers,
            worker_count: statuses.len(),
            workers: statuses,
        }
    }

    async fn spawn_worker(self: &Arc<Self>, worker_id: String) {
        let worker = Worker::new(
            worker_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.tasks),
            Arc::clone(&self.provider),
            self.config.worker.clone(),
        );
        let main_loop = worker.start().await;
        let supervisor = tokio::spawn(supervise(
            worker_id.clone(),
            main_loop,
            worker.shutdown_token(),
            self.events_tx.clone(),
        ));
        info!(worker_id = %worker_id, "worker spawned");
        self.workers
            .write()
            .await
            .insert(worker_id, WorkerHandle { worker, supervisor });
    }

    async fn health_monitor(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<WorkerEvent>) {
        let mut interval = tokio::time::interval(self.config.health_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events_rx.recv() => {
                    match event {
                        Some(WorkerEvent::Crashed { worker_id }) => {
                            self.restart_worker(&worker_id).await;
                        }
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    self.ensure_full_roster().await;
                }
            }
        }
    }

    async fn restart_worker(self: &Arc<Self>, worker_id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let old = self.workers.write().await.remove(worker_id);
        if let Some(old) = old {
            // Force-close whatever the dead loop left behind.
            old.worker.stop().await;
            let _ = old.supervisor.await;
        }
        warn!(worker_id = %worker_id, "restarting crashed worker");
        self.spawn_worker(worker_id.to_string()).await;
    }

    /// Backstop: respawn any roster identity with no live entry.
    async fn ensure_full_roster(self: &Arc<Self>) {
        for index in 0..self.config.max_workers {
            let worker_id = format!("worker-{index}");
            let missing = !self.workers.read().await.contains_key(&worker_id);
            if missing {
                warn!(worker_id = %worker_id, "worker missing from roster, respawning");
                self.spawn_worker(worker_id).await;
            }
        }
    }
}

/// Await a worker's main loop and classify how it ended. An end without
/// the shutdown token cancelled is a crash.
async fn supervise(
    worker_id: String,
    main_loop: JoinHandle<()>,
    intentional_stop: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    match main_loop.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            error!(worker_id = %worker_id, "worker main loop panicked");
        }
        Err(_) => {}
    }
    if !intentional_stop.is_cancelled() {
        warn!(worker_id = %worker_id, "worker terminated unexpectedly");
        let _ = events.send(WorkerEvent::Crashed { worker_id });
    }
}
