//! AppBuilder - store / handler / pool 設定のワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_kinds()` で「このプロセスが処理すべき kind」を宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば起動前に `BuildError::MissingJobKinds`（本番で UnknownJobKind を量産しない）

use std::sync::Arc;

use super::worker_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
use crate::config::RecapConfig;
use crate::domain::{QueueError, RetryPolicy};
use crate::ports::QueueStore;
use crate::typed::{Handler, HandlerRegistry, JobHandler, Task};

/// ```ignore
/// let app = AppBuilder::new()
///     .store(store)
///     .register::<SummarizeMeeting, _>(SummarizeHandler::new(repo))?
///     .expect_kinds(&["summarize"])
///     .build()?;
/// let pool = app.start();
/// ```
pub struct AppBuilder {
    store: Option<Arc<dyn QueueStore>>,
    registry: HandlerRegistry,
    expected_kinds: Option<Vec<String>>,
    pool: WorkerPoolConfig,
    policy: RetryPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing job kinds: {0:?}. These kinds were expected but have no handler.")]
    MissingJobKinds(Vec<String>),

    #[error("no queue store configured")]
    MissingStore,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            registry: HandlerRegistry::new(),
            expected_kinds: None,
            pool: WorkerPoolConfig::default(),
            policy: RetryPolicy::default(),
        }
    }

    /// Pool settings and retry policy from the loaded configuration.
    pub fn from_config(config: &RecapConfig) -> Self {
        Self::new()
            .pool_config(config.worker.pool_config())
            .retry_policy(config.queue.retry_policy())
    }

    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(mut self, handler: H) -> Result<Self, QueueError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_handler(
        mut self,
        kind: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, QueueError> {
        self.registry.register(kind, handler)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn pool_config(mut self, config: WorkerPoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_kinds {
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| !self.registry.contains(kind))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobKinds(missing));
            }
        }

        if self.pool.concurrency == 0 {
            return Err(BuildError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.pool.lease_duration.is_zero() {
            return Err(BuildError::InvalidConfig("lease duration must be positive".into()));
        }
        if self.pool.poll_interval.is_zero() {
            // workers would spin on empty polls
            return Err(BuildError::InvalidConfig("poll interval must be positive".into()));
        }

        let store = self.store.ok_or(BuildError::MissingStore)?;
        Ok(App {
            store,
            registry: Arc::new(self.registry),
            pool: self.pool,
            policy: self.policy,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated wiring, ready to start workers.
pub struct App {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    pool: WorkerPoolConfig,
    policy: RetryPolicy,
}

impl App {
    pub fn start(&self) -> WorkerPoolHandle {
        WorkerPool::spawn(
            self.pool.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.policy.clone(),
        )
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn pool_config(&self) -> &WorkerPoolConfig {
        &self.pool
    }
}
