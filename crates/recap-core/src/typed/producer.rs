//! Typed producer helper.

use async_trait::async_trait;

use super::task::Task;
use crate::domain::{JobId, JobKind, NewJob, QueueError};
use crate::ports::QueueStore;

#[async_trait]
pub trait QueueStoreExt: QueueStore {
    /// Serialize `task` and enqueue it under `T::KIND`.
    async fn enqueue_task<T: Task>(&self, task: &T) -> Result<JobId, QueueError> {
        self.enqueue_job(new_job(task)?).await
    }
}

impl<S: QueueStore + ?Sized> QueueStoreExt for S {}

/// `NewJob` for a typed task, for callers that want to set `run_at` or `max_attempts`.
pub fn new_job<T: Task>(task: &T) -> Result<NewJob, QueueError> {
    let payload = serde_json::to_value(task)
        .map_err(|e| QueueError::handler(format!("cannot encode {} payload: {e}", T::KIND)))?;
    Ok(NewJob::new(JobKind::new(T::KIND), payload))
}
