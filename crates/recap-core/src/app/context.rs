//! JobContext - handler に渡す実行コンテキスト
//!
//! 長い handler は区切りごとに `checkpoint()` を呼ぶ。lease を延長し、
//! lease を失っていれば `LeaseLost`、実行時間の上限を超えていれば `TimedOut` を返す。
//! 強制的なキャンセルはしない（協調的キャンセル）。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{JobId, JobKind, JobRecord, QueueError, WorkerId};
use crate::ports::QueueStore;

pub struct JobContext {
    job_id: JobId,
    kind: JobKind,
    attempt: u32,
    max_attempts: u32,
    worker: WorkerId,
    store: Arc<dyn QueueStore>,
    lease: Duration,
    timeout: Option<Duration>,
    started: Instant,
}

impl JobContext {
    /// `job` must be the record returned by `dequeue_and_lock` for `worker`.
    pub fn new(
        job: &JobRecord,
        worker: WorkerId,
        store: Arc<dyn QueueStore>,
        lease: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            worker,
            store,
            lease,
            timeout,
            started: Instant::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    /// 1-indexed attempt number of this execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_timed_out(&self) -> bool {
        self.timeout.is_some_and(|limit| self.elapsed() > limit)
    }

    /// Renew the lease and check the execution budget.
    ///
    /// Handlers should propagate the error with `?`.
    pub async fn checkpoint(&self) -> Result<(), QueueError> {
        if let Some(limit) = self.timeout {
            if self.elapsed() > limit {
                return Err(QueueError::TimedOut(limit));
            }
        }

        if !self
            .store
            .renew_lease(self.job_id, &self.worker, self.lease)
            .await?
        {
            return Err(QueueError::LeaseLost(self.job_id));
        }
        Ok(())
    }
}
