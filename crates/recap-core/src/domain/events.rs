//! Queue events: one per state transition, for the observability sink.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::{JobId, WorkerId};
use super::job::JobKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        job_id: JobId,
        kind: JobKind,
    },
    Locked {
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
    },
    /// An expired lease was taken over by another dequeue.
    LeaseReclaimed {
        job_id: JobId,
        previous: Option<WorkerId>,
        worker: WorkerId,
        attempt: u32,
    },
    /// The reaper returned an expired lease to pending.
    LeaseExpired {
        job_id: JobId,
        previous: Option<WorkerId>,
    },
    LeaseRenewed {
        job_id: JobId,
        worker: WorkerId,
    },
    /// complete/fail/renew was a no-op because the lock no longer matches.
    LeaseLost {
        job_id: JobId,
        worker: WorkerId,
    },
    Completed {
        job_id: JobId,
        worker: WorkerId,
        attempts: u32,
    },
    RetryScheduled {
        job_id: JobId,
        attempts: u32,
        #[serde(with = "millis")]
        delay: Duration,
        error: String,
    },
    Failed {
        job_id: JobId,
        attempts: u32,
        error: String,
    },
    Requeued {
        job_id: JobId,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            QueueEvent::Enqueued { job_id, .. }
            | QueueEvent::Locked { job_id, .. }
            | QueueEvent::LeaseReclaimed { job_id, .. }
            | QueueEvent::LeaseExpired { job_id, .. }
            | QueueEvent::LeaseRenewed { job_id, .. }
            | QueueEvent::LeaseLost { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::RetryScheduled { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Requeued { job_id } => *job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued { .. } => "enqueued",
            QueueEvent::Locked { .. } => "locked",
            QueueEvent::LeaseReclaimed { .. } => "lease_reclaimed",
            QueueEvent::LeaseExpired { .. } => "lease_expired",
            QueueEvent::LeaseRenewed { .. } => "lease_renewed",
            QueueEvent::LeaseLost { .. } => "lease_lost",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::RetryScheduled { .. } => "retry_scheduled",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::Requeued { .. } => "requeued",
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
