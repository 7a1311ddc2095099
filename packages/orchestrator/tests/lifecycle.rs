//! End-to-end lifecycle coverage: submit through manager, execute through
//! workers, observe outcomes in the store.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use orchestrator::{
    FailureKind, JobManager, JobRecord, JobStatus, JobStore, MemoryJobStore, RetryPolicy,
    SubmitOptions, TaskContext, TaskRegistry, Worker,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use common::{fast_worker_config, wait_for_status, wait_for_terminal, TrackingProvider};

fn fast_store() -> Arc<dyn JobStore> {
    Arc::new(MemoryJobStore::with_retry_policy(RetryPolicy {
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(100),
    }))
}

#[tokio::test]
async fn failing_job_retries_and_eventually_succeeds() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in = Arc::clone(&attempts);
    let mut registry = TaskRegistry::new();
    registry.register("flaky", move |_ctx: TaskContext| {
        let attempts = Arc::clone(&attempts_in);
        async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(anyhow!("transient failure on attempt {n}"))
            } else {
                Ok(json!({ "attempts": n }))
            }
        }
    });

    let (provider, _, _) = TrackingProvider::new();
    let worker = Worker::new(
        "worker-0",
        Arc::clone(&store),
        Arc::new(registry),
        provider,
        fast_worker_config(dir.path()),
    );
    let handle = worker.start().await;

    let job = JobRecord::builder()
        .task_name("flaky")
        .max_retries(3)
        .build();
    let id = job.id;
    store.add_job(job).await.unwrap();

    let job = wait_for_status(&store, id, JobStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.result.unwrap()["attempts"], 3);
    assert!(job.finished_at.is_some());

    worker.stop().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn retry_budget_bounds_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in = Arc::clone(&attempts);
    let mut registry = TaskRegistry::new();
    registry.register("doomed", move |_ctx: TaskContext| {
        let attempts = Arc::clone(&attempts_in);
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(anyhow!("always fails"))
        }
    });

    let (provider, _, _) = TrackingProvider::new();
    let worker = Worker::new(
        "worker-0",
        Arc::clone(&store),
        Arc::new(registry),
        provider,
        fast_worker_config(dir.path()),
    );
    let handle = worker.start().await;

    let job = JobRecord::builder()
        .task_name("doomed")
        .max_retries(2)
        .build();
    let id = job.id;
    store.add_job(job).await.unwrap();

    let job = wait_for_status(&store, id, JobStatus::Failed, Duration::from_secs(5)).await;
    let total = attempts.load(Ordering::SeqCst);
    assert_eq!(total, 2);
    assert!(total <= 2 + 1, "more than max_retries + 1 attempts");
    assert_eq!(job.retry_count, 2);

    // Permanently failed jobs land in the dead letter queue.
    let dead = store.list_dead_letter(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, id);

    worker.stop().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn zero_retry_budget_means_exactly_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in = Arc::clone(&attempts);
    let mut registry = TaskRegistry::new();
    registry.register("doomed", move |_ctx: TaskContext| {
        let attempts = Arc::clone(&attempts_in);
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(anyhow!("always fails"))
        }
    });

    let (provider, _, _) = TrackingProvider::new();
    let worker = Worker::new(
        "worker-0",
        Arc::clone(&store),
        Arc::new(registry),
        provider,
        fast_worker_config(dir.path()),
    );
    let handle = worker.start().await;

    let job = JobRecord::builder()
        .task_name("doomed")
        .max_retries(0)
        .build();
    let id = job.id;
    store.add_job(job).await.unwrap();

    let job = wait_for_status(&store, id, JobStatus::Failed, Duration::from_secs(5)).await;
    // No retries: the job is terminal after the single attempt.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(job.retry_count, 1);

    let dead = store.list_dead_letter(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, id);

    worker.stop().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn job_exceeding_deadline_ends_as_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();

    let mut registry = TaskRegistry::new();
    // Ignores its cancellation token on purpose.
    registry.register("stubborn", |_ctx: TaskContext| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    });

    let (provider, creates, closes) = TrackingProvider::new();
    let worker = Worker::new(
        "worker-0",
        Arc::clone(&store),
        Arc::new(registry),
        provider,
        fast_worker_config(dir.path()),
    );
    let handle = worker.start().await;

    let job = JobRecord::builder()
        .task_name("stubborn")
        .timeout_seconds(1i64)
        .max_retries(1)
        .build();
    let id = job.id;
    store.add_job(job).await.unwrap();

    let job = wait_for_status(&store, id, JobStatus::TimedOut, Duration::from_secs(5)).await;
    assert_eq!(job.error.as_deref(), Some("job timed out after 1 seconds"));
    assert!(job.finished_at.is_some());

    worker.stop().await;
    handle.await.unwrap();

    // The scope acquired for the dropped job future was still closed.
    assert_eq!(creates.load(Ordering::SeqCst), closes.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancelled_job_is_skipped_and_priority_order_holds() {
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();

    let executed: Arc<Mutex<Vec<uuid::Uuid>>> = Arc::new(Mutex::new(Vec::new()));
    let executed_in = Arc::clone(&executed);
    let mut registry = TaskRegistry::new();
    registry.register("record", move |ctx: TaskContext| {
        let executed = Arc::clone(&executed_in);
        async move {
            executed.lock().await.push(ctx.job_id);
            Ok(Value::Null)
        }
    });

    let normal = JobRecord::builder().task_name("record").build();
    let urgent = JobRecord::builder().task_name("record").priority(10).build();
    let normal_id = normal.id;
    let urgent_id = urgent.id;
    store.add_job(normal).await.unwrap();
    store.add_job(urgent).await.unwrap();

    // Cancel before any worker exists.
    assert!(store.cancel(normal_id).await.unwrap());

    let (provider, _, _) = TrackingProvider::new();
    let worker = Worker::new(
        "worker-0",
        Arc::clone(&store),
        Arc::new(registry),
        provider,
        fast_worker_config(dir.path()),
    );
    let handle = worker.start().await;

    wait_for_status(&store, urgent_id, JobStatus::Completed, Duration::from_secs(5)).await;
    // Give the worker a chance to (incorrectly) pick up the cancelled job.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let normal = store.get_job(normal_id).await.unwrap().unwrap();
    assert_eq!(normal.status, JobStatus::Cancelled);
    assert_eq!(executed.lock().await.as_slice(), &[urgent_id]);

    worker.stop().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn each_job_executes_exactly_once_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();

    let counts: Arc<Mutex<HashMap<uuid::Uuid, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let counts_in = Arc::clone(&counts);
    let mut registry = TaskRegistry::new();
    registry.register("count", move |ctx: TaskContext| {
        let counts = Arc::clone(&counts_in);
        async move {
            *counts.lock().await.entry(ctx.job_id).or_insert(0) += 1;
            // Hold the job briefly so claims overlap.
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Value::Null)
        }
    });
    let registry = Arc::new(registry);

    let mut workers = Vec::new();
    for index in 0..4 {
        let (provider, _, _) = TrackingProvider::new();
        let worker = Worker::new(
            format!("worker-{index}"),
            Arc::clone(&store),
            Arc::clone(&registry),
            provider,
            fast_worker_config(dir.path()),
        );
        let handle = worker.start().await;
        workers.push((worker, handle));
    }

    let mut ids = Vec::new();
    for _ in 0..20 {
        let job = JobRecord::builder().task_name("count").build();
        ids.push(job.id);
        store.add_job(job).await.unwrap();
    }

    for id in &ids {
        wait_for_status(&store, *id, JobStatus::Completed, Duration::from_secs(10)).await;
    }

    let counts = counts.lock().await;
    for id in &ids {
        assert_eq!(counts.get(id), Some(&1), "job {id} executed more than once");
    }

    for (worker, handle) in workers {
        worker.stop().await;
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn scopes_balance_across_mixed_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();

    let mut registry = TaskRegistry::new();
    registry.register("ok", |_ctx: TaskContext| async move { Ok(Value::Null) });
    registry.register("bad", |_ctx: TaskContext| async move {
        Err::<Value, _>(anyhow!("scrape failed"))
    });
    registry.register("slow", |_ctx: TaskContext| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    });

    let (provider, creates, closes) = TrackingProvider::new();
    let worker = Worker::new(
        "worker-0",
        Arc::clone(&store),
        Arc::new(registry),
        provider,
        fast_worker_config(dir.path()),
    );
    let handle = worker.start().await;

    let ok = JobRecord::builder().task_name("ok").build();
    let bad = JobRecord::builder().task_name("bad").max_retries(1).build();
    let slow = JobRecord::builder()
        .task_name("slow")
        .timeout_seconds(1i64)
        .max_retries(1)
        .build();
    let ids = [ok.id, bad.id, slow.id];
    store.add_job(ok).await.unwrap();
    store.add_job(bad).await.unwrap();
    store.add_job(slow).await.unwrap();

    for id in ids {
        wait_for_terminal(&store, id, Duration::from_secs(10)).await;
    }

    worker.stop().await;
    handle.await.unwrap();

    assert!(creates.load(Ordering::SeqCst) >= 3);
    assert_eq!(
        creates.load(Ordering::SeqCst),
        closes.load(Ordering::SeqCst),
        "leaked scopes"
    );
    assert_eq!(worker.status().await.active_scopes, 0);
}

#[tokio::test]
async fn dead_letter_replay_through_manager() {
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();
    let manager = JobManager::new(Arc::clone(&store), Duration::from_secs(60));
    manager.start().await.unwrap();

    let broken = Arc::new(AtomicBool::new(true));
    let broken_in = Arc::clone(&broken);
    let mut registry = TaskRegistry::new();
    registry.register("sometimes", move |_ctx: TaskContext| {
        let broken = Arc::clone(&broken_in);
        async move {
            if broken.load(Ordering::SeqCst) {
                Err(anyhow!("upstream down"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    });

    let (provider, _, _) = TrackingProvider::new();
    let worker = Worker::new(
        "worker-0",
        Arc::clone(&store),
        Arc::new(registry),
        provider,
        fast_worker_config(dir.path()),
    );
    let handle = worker.start().await;

    let id = manager
        .submit(
            SubmitOptions::builder()
                .task_name("sometimes")
                .max_retries(1)
                .build(),
        )
        .await
        .unwrap();
    wait_for_status(&store, id, JobStatus::Failed, Duration::from_secs(5)).await;

    let dead = manager.list_dead_letter(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, id);

    // Fix the upstream and replay.
    broken.store(false, Ordering::SeqCst);
    let replay_id = manager.replay_dead_letter(id, true).await.unwrap().unwrap();
    assert_ne!(replay_id, id);

    let replay =
        wait_for_status(&store, replay_id, JobStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(replay.result.unwrap()["ok"], true);
    assert!(manager.list_dead_letter(10).await.unwrap().is_empty());

    worker.stop().await;
    handle.await.unwrap();
    manager.stop().await;
}

#[tokio::test]
async fn worker_stop_mid_job_releases_scope() {
    let dir = tempfile::tempdir().unwrap();
    let store = fast_store();

    let mut registry = TaskRegistry::new();
    registry.register("cooperative", |ctx: TaskContext| async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(Value::Null),
            _ = ctx.cancel.cancelled() => Err(anyhow!("cancelled mid-scrape")),
        }
    });

    let (provider, creates, closes) = TrackingProvider::new();
    let worker = Worker::new(
        "worker-0",
        Arc::clone(&store),
        Arc::new(registry),
        provider,
        fast_worker_config(dir.path()),
    );
    let handle = worker.start().await;

    let job = JobRecord::builder()
        .task_name("cooperative")
        .timeout_seconds(60i64)
        .build();
    let id = job.id;
    store.add_job(job).await.unwrap();
    wait_for_status(&store, id, JobStatus::Running, Duration::from_secs(5)).await;

    worker.stop().await;
    handle.await.unwrap();

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_ne!(job.status, JobStatus::Running, "job left running after stop");
    assert_eq!(creates.load(Ordering::SeqCst), closes.load(Ordering::SeqCst));
    assert_eq!(worker.status().await.active_scopes, 0);
}

#[tokio::test]
async fn retried_job_waits_out_its_backoff_window() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::with_retry_policy(RetryPolicy {
        backoff_base: Duration::from_millis(200),
        backoff_cap: Duration::from_millis(200),
    }));

    let job = JobRecord::builder()
        .task_name("scrape_listing")
        .max_retries(3)
        .build();
    let id = job.id;
    store.add_job(job).await.unwrap();
    assert_eq!(store.get_next_job().await.unwrap(), Some(id));
    store.mark_running(id, "worker-0").await.unwrap();
    store
        .mark_failed(id, "flaky page", true, FailureKind::Error)
        .await
        .unwrap();

    // Invisible while the stamp is in the future, visible afterwards.
    assert_eq!(store.get_next_job().await.unwrap(), None);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.get_next_job().await.unwrap(), Some(id));
}
