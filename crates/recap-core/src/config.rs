//! Configuration.
//!
//! Sources, later ones win:
//! 1. built-in defaults
//! 2. `recap.toml` (optional) or an explicit file
//! 3. `RECAP_*` environment variables, `__` between sections
//!    (`RECAP_WORKER__CONCURRENCY=8`, `RECAP_DATABASE_URL=postgres://...`)

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::WorkerPoolConfig;
use crate::domain::{QueueError, RetryPolicy};

const ENV_PREFIX: &str = "RECAP";
const DEFAULT_FILE: &str = "recap";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecapConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,

    /// PostgreSQL URL. `None` selects the in-memory store.
    pub database_url: Option<String>,

    pub log: LogConfig,
}

/// Queue-wide policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default ceiling for jobs enqueued without an override.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: None,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::exponential(Duration::from_millis(self.base_delay_ms));
        match self.max_delay_ms {
            Some(ms) => policy.with_max_delay(Duration::from_millis(ms)),
            None => policy,
        }
    }
}

/// Worker pool settings, durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub poll_jitter_ms: u64,
    pub lease_ms: u64,
    pub job_timeout_ms: Option<u64>,
    pub reap_interval_ms: Option<u64>,

    /// PostgreSQL pool size.
    pub db_max_connections: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "recap".to_string(),
            concurrency: 4,
            poll_interval_ms: 1000,
            poll_jitter_ms: 250,
            lease_ms: 30_000,
            job_timeout_ms: Some(120_000),
            reap_interval_ms: Some(15_000),
            db_max_connections: 10,
        }
    }
}

impl WorkerConfig {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            name: self.name.clone(),
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_jitter: Duration::from_millis(self.poll_jitter_ms),
            lease_duration: Duration::from_millis(self.lease_ms),
            job_timeout: self.job_timeout_ms.map(Duration::from_millis),
            reap_interval: self.reap_interval_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RecapConfig {
    /// Load from `file` (or an optional `recap.toml`) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, QueueError> {
        Self::load_with_env(file, None)
    }

    /// Like `load`, with the environment given explicitly instead of read
    /// from the process.
    pub fn load_with_env(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, QueueError> {
        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_FILE).required(false),
        };

        let cfg: RecapConfig = config::Config::builder()
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, QueueError> {
        let cfg: RecapConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.worker.concurrency == 0 {
            return Err(QueueError::Config("worker.concurrency must be at least 1".into()));
        }
        if self.worker.lease_ms == 0 {
            return Err(QueueError::Config("worker.lease_ms must be positive".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(QueueError::Config("queue.max_attempts must be at least 1".into()));
        }
        if self.queue.base_delay_ms == 0 {
            return Err(QueueError::Config("queue.base_delay_ms must be positive".into()));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(QueueError::Config("worker.poll_interval_ms must be positive".into()));
        }
        if self.worker.name.is_empty() {
            return Err(QueueError::Config("worker.name must not be empty".into()));
        }
        Ok(())
    }
}
