//! Per-job resource scopes.
//!
//! A scope is an isolated runtime a job executes inside (a browser context
//! in the scraping deployment). The concrete runtime lives behind
//! `ResourceProvider`; this module only guarantees the bookkeeping: every
//! acquired scope is registered until released, and release always closes,
//! even when the job failed or the worker is shutting down.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Creation options forwarded to the provider, pulled from job params.
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    pub user_agent: Option<String>,
    pub headless: Option<bool>,
    pub proxy: Option<String>,
}

impl ScopeOptions {
    /// Extract the provider-relevant keys from a job's params blob.
    /// Unknown or mistyped keys are ignored.
    pub fn from_params(params: &Value) -> Self {
        Self {
            user_agent: params
                .get("user_agent")
                .and_then(Value::as_str)
                .map(String::from),
            headless: params.get("headless").and_then(Value::as_bool),
            proxy: params.get("proxy").and_then(Value::as_str).map(String::from),
        }
    }
}

/// An isolated execution scope. Closing is idempotent from the manager's
/// point of view: it is called exactly once per acquired scope.
#[async_trait]
pub trait ResourceScope: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Factory for scopes. The concrete implementation is supplied by the
/// embedding application.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create(&self, job_id: Uuid, options: &ScopeOptions)
        -> Result<Arc<dyn ResourceScope>>;
}

/// Tracks the scopes a single worker has open, keyed by job id.
pub struct ScopeManager {
    provider: Arc<dyn ResourceProvider>,
    active: Mutex<HashMap<Uuid, Arc<dyn ResourceScope>>>,
}

impl ScopeManager {
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            provider,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a scope for a job. Creation failures propagate;
    /// nothing is registered in that case.
    pub async fn acquire(
        &self,
        job_id: Uuid,
        options: &ScopeOptions,
    ) -> Result<Arc<dyn ResourceScope>> {
        let scope = self.provider.create(job_id, options).await?;
        self.active.lock().await.insert(job_id, Arc::clone(&scope));
        debug!(job_id = %job_id, "scope acquired");
        Ok(scope)
    }

    /// Close and deregister the scope for a job. Close errors are logged,
    /// never propagated: the job outcome is already decided by the time we
    /// get here. No-op if the job holds no scope.
    pub async fn release(&self, job_id: Uuid) {
        let scope = self.active.lock().await.remove(&job_id);
        if let Some(scope) = scope {
            if let Err(e) = scope.close().await {
                warn!(job_id = %job_id, error = %e, "failed to close scope");
            } else {
                debug!(job_id = %job_id, "scope released");
            }
        }
    }

    /// Force-close every open scope. Each close is isolated so one bad
    /// scope cannot strand the rest.
    pub async fn release_all(&self) {
        let drained: Vec<(Uuid, Arc<dyn ResourceScope>)> =
            self.active.lock().await.drain().collect();
        for (job_id, scope) in drained {
            if let Err(e) = scope.close().await {
                warn!(job_id = %job_id, error = %e, "failed to close scope during shutdown");
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}
