//! Handler traits.
//!
//! - `JobHandler`: object-safe。registry に `Arc<dyn JobHandler>` として格納する
//! - `Handler<T>`: 型付き。`T: Task` の payload を受け取る
//! - `TypedHandler<T, H>`: `Handler<T>` を `JobHandler` に変換する（type erasure）

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::app::JobContext;
use crate::domain::QueueError;

/// Business logic for one job kind.
///
/// Errors are interpreted by the worker pool:
/// - `HandlerFailure` / `TimedOut`: retried per the retry policy
/// - `LeaseLost`: the job is abandoned silently
/// - anything else: terminal failure
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), QueueError>;
}

/// Typed handler. `Handler<SummarizeMeeting>` only ever sees a decoded `SummarizeMeeting`.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: &JobContext, task: T) -> Result<(), QueueError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> JobHandler for TypedHandler<T, H> {
    async fn handle(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), QueueError> {
        // a malformed payload counts as a handler failure and goes through retry
        let task: T = serde_json::from_value(payload.clone())
            .map_err(|e| QueueError::handler(format!("invalid {} payload: {e}", T::KIND)))?;
        self.handler.handle(ctx, task).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::impls::InMemoryQueueStore;
    use crate::ports::QueueStore;
    use crate::typed::SummarizeMeeting;
    use crate::domain::WorkerId;

    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Handler<SummarizeMeeting> for CountingHandler {
        async fn handle(&self, _ctx: &JobContext, task: SummarizeMeeting) -> Result<(), QueueError> {
            assert_eq!(task.meeting_id, "m1");
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn context() -> JobContext {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
        let worker = WorkerId::new("w-0");
        store
            .enqueue("summarize".into(), serde_json::json!({ "meetingId": "m1" }))
            .await
            .unwrap();
        let job = store
            .dequeue_and_lock(&worker, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        JobContext::new(&job, worker, store, Duration::from_secs(30), None)
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let typed = TypedHandler::new(CountingHandler { seen: AtomicUsize::new(0) });
        let ctx = context().await;

        typed
            .handle(&ctx, &serde_json::json!({ "meetingId": "m1" }))
            .await
            .unwrap();
        assert_eq!(typed.handler.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_retryable_failure() {
        let typed = TypedHandler::new(CountingHandler { seen: AtomicUsize::new(0) });
        let ctx = context().await;

        let err = typed
            .handle(&ctx, &serde_json::json!({ "meeting": 42 }))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("invalid summarize payload"));
        assert_eq!(typed.handler.seen.load(Ordering::SeqCst), 0);
    }
}
