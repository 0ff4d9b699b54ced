//! EventSink implementations.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::domain::QueueEvent;
use crate::ports::EventSink;

/// Reports every transition as a structured `tracing` event (target `recap::queue`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Enqueued { job_id, kind } => {
                info!(target: "recap::queue", %job_id, %kind, "job enqueued");
            }
            QueueEvent::Locked { job_id, worker, attempt } => {
                info!(target: "recap::queue", %job_id, %worker, attempt, "job locked");
            }
            QueueEvent::LeaseReclaimed { job_id, previous, worker, attempt } => {
                warn!(
                    target: "recap::queue",
                    %job_id,
                    previous = previous.as_ref().map(|w| w.as_str()),
                    %worker,
                    attempt,
                    "expired lease reclaimed"
                );
            }
            QueueEvent::LeaseExpired { job_id, previous } => {
                warn!(
                    target: "recap::queue",
                    %job_id,
                    previous = previous.as_ref().map(|w| w.as_str()),
                    "expired lease returned to pending"
                );
            }
            QueueEvent::LeaseRenewed { job_id, worker } => {
                tracing::debug!(target: "recap::queue", %job_id, %worker, "lease renewed");
            }
            QueueEvent::LeaseLost { job_id, worker } => {
                warn!(target: "recap::queue", %job_id, %worker, "lease lost");
            }
            QueueEvent::Completed { job_id, worker, attempts } => {
                info!(target: "recap::queue", %job_id, %worker, attempts, "job completed");
            }
            QueueEvent::RetryScheduled { job_id, attempts, delay, error } => {
                warn!(
                    target: "recap::queue",
                    %job_id,
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "job retry scheduled"
                );
            }
            QueueEvent::Failed { job_id, attempts, error } => {
                tracing::error!(target: "recap::queue", %job_id, attempts, error = %error, "job failed");
            }
            QueueEvent::Requeued { job_id } => {
                info!(target: "recap::queue", %job_id, "failed job requeued");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &QueueEvent) {}
}

/// Records events in memory. Test helper.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<QueueEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Event names in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(QueueEvent::name).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &QueueEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
