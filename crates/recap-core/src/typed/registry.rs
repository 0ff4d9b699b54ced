//! HandlerRegistry - job kind -> handler
//!
//! 起動時に組み立て（mutable）、実行時は `Arc` で共有して読むだけ（immutable）。
//! ロックは不要。

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, JobHandler, TypedHandler};
use super::task::Task;
use crate::domain::{JobKind, QueueError};

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an untyped handler. A kind can be registered only once.
    pub fn register(
        &mut self,
        kind: impl Into<JobKind>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            return Err(QueueError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Register a typed handler under `T::KIND`.
    pub fn register_typed<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), QueueError> {
        self.register(T::KIND, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn get(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(&JobKind::new(kind))
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::app::JobContext;
    use crate::typed::SummarizeMeeting;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _ctx: &JobContext, _payload: &serde_json::Value) -> Result<(), QueueError> {
            Ok(())
        }
    }

    struct Summarize;

    #[async_trait]
    impl Handler<SummarizeMeeting> for Summarize {
        async fn handle(&self, _ctx: &JobContext, _task: SummarizeMeeting) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register("render_pdf", Arc::new(Noop)).unwrap();
        registry.register_typed::<SummarizeMeeting, _>(Summarize).unwrap();

        assert!(registry.get(&JobKind::new("summarize")).is_some());
        assert!(registry.get(&JobKind::new("render_pdf")).is_some());
        assert!(registry.get(&JobKind::new("push_slack")).is_none());
        assert_eq!(
            registry.kinds(),
            vec![JobKind::new("render_pdf"), JobKind::new("summarize")]
        );
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed::<SummarizeMeeting, _>(Summarize).unwrap();

        let err = registry.register("summarize", Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateHandler(kind) if kind.as_str() == "summarize"));
        assert_eq!(registry.len(), 1);
    }
}
