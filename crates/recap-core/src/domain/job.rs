//! Job record: the unit of work plus its execution metadata.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QueueError;
use super::ids::{JobId, WorkerId};
use super::state::JobState;

/// Discriminator that selects the handler (e.g. `"summarize"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKind(String);

impl JobKind {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Enqueue request.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: serde_json::Value,

    /// Overrides the store's default ceiling.
    pub max_attempts: Option<u32>,

    /// Earliest dequeue time. `None` means now.
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(kind: impl Into<JobKind>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            max_attempts: None,
            run_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// The ceiling this job will be stored with. Zero is rejected: no attempt
    /// could ever run within it.
    pub fn effective_max_attempts(&self, default_max_attempts: u32) -> Result<u32, QueueError> {
        match self.max_attempts.unwrap_or(default_max_attempts) {
            0 => Err(QueueError::Config(format!(
                "max_attempts must be at least 1 (job kind {})",
                self.kind
            ))),
            n => Ok(n),
        }
    }
}

/// A job as stored by the Queue Store.
///
/// `id`, `seq`, `kind`, `payload` and `max_attempts` are write-once. Everything
/// else changes only through the transition methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,

    /// Creation order; FIFO tie-breaker when `next_run_at` is equal.
    pub seq: u64,

    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub state: JobState,

    /// Incremented on every dequeue, including lease reclaims.
    pub attempts: u32,
    pub max_attempts: u32,

    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<WorkerId>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: JobId, seq: u64, job: NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            seq,
            kind: job.kind,
            payload: job.payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: job.max_attempts.unwrap_or(default_max_attempts),
            next_run_at: job.run_at.unwrap_or(now),
            locked_by: None,
            lock_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and due, or active with an expired lease.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => self.next_run_at <= now,
            JobState::Active => self.lease_expired(now),
            _ => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lock_expires_at.is_some_and(|t| t <= now)
    }

    pub fn holds_lease(&self, worker: &WorkerId) -> bool {
        self.state == JobState::Active && self.locked_by.as_ref() == Some(worker)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Lease the job to `worker` and count the attempt.
    pub fn start_attempt(&mut self, worker: WorkerId, lease: Duration, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts += 1;
        self.locked_by = Some(worker);
        self.lock_expires_at = Some(after(now, lease));
        self.updated_at = now;
    }

    pub fn renew_lease(&mut self, lease: Duration, now: DateTime<Utc>) {
        self.lock_expires_at = Some(after(now, lease));
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.clear_lock();
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, delay: Duration, error: String, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.next_run_at = after(now, delay);
        self.last_error = Some(error);
        self.clear_lock();
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self.clear_lock();
        self.updated_at = now;
    }

    /// Lease recovery: back to pending, `attempts` untouched.
    pub fn release_lease(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.clear_lock();
        self.updated_at = now;
    }

    /// Manual requeue of a failed job. `last_error` is kept as history.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.attempts = 0;
        self.next_run_at = now;
        self.clear_lock();
        self.updated_at = now;
    }

    fn clear_lock(&mut self) {
        self.locked_by = None;
        self.lock_expires_at = None;
    }
}

/// `now + d`, saturating at the far end of the calendar.
pub fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
