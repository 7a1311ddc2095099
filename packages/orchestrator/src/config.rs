//! Environment-driven configuration.
//!
//! Every knob has a code default; the environment overrides. `DATABASE_URL`
//! selects the Postgres backend when present.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::pool::PoolConfig;
use crate::store::RetryPolicy;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub database_url: Option<String>,
    pub max_workers: usize,
    pub data_root: PathBuf,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub health_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_workers: 3,
            data_root: PathBuf::from("./data"),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the environment (reading `.env` if present).
    /// Unset variables fall back to defaults; malformed values are errors.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            max_workers: parse_var("ORCHESTRATOR_MAX_WORKERS", defaults.max_workers)?,
            data_root: std::env::var("ORCHESTRATOR_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            poll_interval: secs_var("ORCHESTRATOR_POLL_SECS", defaults.poll_interval)?,
            heartbeat_interval: secs_var(
                "ORCHESTRATOR_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            )?,
            sweep_interval: secs_var("ORCHESTRATOR_SWEEP_SECS", defaults.sweep_interval)?,
            health_interval: secs_var("ORCHESTRATOR_HEALTH_SECS", defaults.health_interval)?,
            retry: RetryPolicy {
                backoff_base: secs_var(
                    "ORCHESTRATOR_BACKOFF_BASE_SECS",
                    defaults.retry.backoff_base,
                )?,
                backoff_cap: secs_var(
                    "ORCHESTRATOR_BACKOFF_CAP_SECS",
                    defaults.retry.backoff_cap,
                )?,
            },
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            data_root: self.data_root.clone(),
            ..WorkerConfig::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.max_workers,
            health_interval: self.health_interval,
            worker: self.worker_config(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow!("{name} has invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(parse_var(
        name,
        default.as_secs(),
    )?))
}
