//! QueueStore port - ジョブ状態の正本（source of truth）
//!
//! 全 worker の協調はこの trait を通してのみ行う。worker 間で共有する
//! インメモリのロックは存在しない（別プロセス・別マシンでも正しく動くこと）。
//!
//! # 設計原則
//! - `dequeue_and_lock` は 1 回の原子的な条件付き更新で実装する
//! - lease の権威はここにある。`complete` / `fail` / `renew_lease` は
//!   `WorkerId` を fencing token として照合し、一致しなければ no-op (`false`)
//! - ストレージ障害は `QueueError::Storage` としてすぐに返す。内部リトライはしない

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobKind, JobRecord, NewJob, QueueError, WorkerId};

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.completed + self.failed
    }

    /// Nothing left to run.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.active == 0
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new pending job and return its id. Never waits for execution.
    async fn enqueue_job(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Enqueue with the store's defaults: due now, default `max_attempts`.
    async fn enqueue(&self, kind: JobKind, payload: serde_json::Value) -> Result<JobId, QueueError> {
        self.enqueue_job(NewJob::new(kind, payload)).await
    }

    /// Atomically claim the oldest eligible job (pending and due, or active with
    /// an expired lease), lease it to `worker` and count the attempt.
    ///
    /// Returns `None` right away when nothing is eligible.
    async fn dequeue_and_lock(
        &self,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError>;

    /// Active with a matching lock -> completed. Otherwise a no-op returning `false`.
    async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<bool, QueueError>;

    /// `Some(delay)`: back to pending after `delay`. `None`: failed for good.
    /// Returns `false` (no-op) when the lock no longer matches.
    async fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        next_delay: Option<Duration>,
    ) -> Result<bool, QueueError>;

    /// Extend the lease. `false` means the lease is gone and the caller must stop.
    async fn renew_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<bool, QueueError>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Terminally failed jobs, oldest first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<JobRecord>, QueueError>;

    /// Failed -> pending with attempts reset. `false` if the job is not failed.
    async fn requeue_failed(&self, job_id: JobId) -> Result<bool, QueueError>;

    /// Return every expired lease to pending without touching `attempts`.
    ///
    /// A lease that expired on the final attempt is marked failed instead.
    async fn reap_expired_leases(&self) -> Result<Vec<JobId>, QueueError>;
}

/// Error text recorded when a lease runs out on the last allowed attempt.
pub const LEASE_EXPIRED_ON_FINAL_ATTEMPT: &str = "lease expired on final attempt";
