//! In-memory Queue Store (dev / tests).
//!
//! All records sit behind one `tokio::sync::Mutex`; every operation runs inside
//! a single critical section, so `dequeue_and_lock` is atomic by construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::QueueConfig;
use crate::domain::{JobId, JobRecord, JobState, NewJob, QueueError, QueueEvent, WorkerId};
use crate::impls::NoopEventSink;
use crate::ports::{
    Clock, EventSink, IdGenerator, LEASE_EXPIRED_ON_FINAL_ATTEMPT, QueueCounts, QueueStore,
    SystemClock, UlidGenerator,
};

struct InMemoryState {
    jobs: HashMap<JobId, JobRecord>,
    next_seq: u64,
}

impl InMemoryState {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_seq: 1,
        }
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Expired leases on the last allowed attempt cannot be re-dequeued
    /// without breaking `attempts <= max_attempts`; fail them instead.
    fn fail_exhausted_leases(&mut self, now: DateTime<Utc>, events: &mut Vec<QueueEvent>) {
        for job in self.jobs.values_mut() {
            if job.lease_expired(now) && job.attempts_exhausted() {
                job.mark_failed(LEASE_EXPIRED_ON_FINAL_ATTEMPT.to_string(), now);
                events.push(QueueEvent::Failed {
                    job_id: job.id,
                    attempts: job.attempts,
                    error: LEASE_EXPIRED_ON_FINAL_ATTEMPT.to_string(),
                });
            }
        }
    }

    /// Oldest `next_run_at` first, creation order on ties.
    fn next_eligible(&self, now: DateTime<Utc>) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .min_by_key(|job| (job.next_run_at, job.seq))
            .map(|job| job.id)
    }
}

pub struct InMemoryQueueStore {
    state: Mutex<InMemoryState>,
    default_max_attempts: u32,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl InMemoryQueueStore {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(InMemoryState::new()),
            default_max_attempts: config.max_attempts,
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    fn emit_all(&self, events: &[QueueEvent]) {
        for event in events {
            self.sink.emit(event);
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue_job(&self, job: NewJob) -> Result<JobId, QueueError> {
        let max_attempts = job.effective_max_attempts(self.default_max_attempts)?;
        let now = self.clock.now();
        let id = UlidGenerator::new(Arc::clone(&self.clock)).generate_job_id();

        let mut state = self.state.lock().await;
        let seq = state.allocate_seq();
        let record = JobRecord::new(id, seq, job, max_attempts, now);
        let kind = record.kind.clone();
        state.jobs.insert(id, record);
        drop(state);

        self.sink.emit(&QueueEvent::Enqueued { job_id: id, kind });
        Ok(id)
    }

    async fn dequeue_and_lock(
        &self,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let mut state = self.state.lock().await;
        state.fail_exhausted_leases(now, &mut events);

        let claimed = match state.next_eligible(now) {
            Some(id) => state.jobs.get_mut(&id).map(|job| {
                let reclaimed = job.state == JobState::Active;
                let previous = job.locked_by.clone();
                job.start_attempt(worker.clone(), lease, now);

                events.push(if reclaimed {
                    QueueEvent::LeaseReclaimed {
                        job_id: job.id,
                        previous,
                        worker: worker.clone(),
                        attempt: job.attempts,
                    }
                } else {
                    QueueEvent::Locked {
                        job_id: job.id,
                        worker: worker.clone(),
                        attempt: job.attempts,
                    }
                });
                job.clone()
            }),
            None => None,
        };
        drop(state);

        self.emit_all(&events);
        Ok(claimed)
    }

    async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let event = match state.jobs.get_mut(&job_id) {
            Some(job) if job.holds_lease(worker) => {
                job.mark_completed(now);
                QueueEvent::Completed {
                    job_id,
                    worker: worker.clone(),
                    attempts: job.attempts,
                }
            }
            _ => QueueEvent::LeaseLost {
                job_id,
                worker: worker.clone(),
            },
        };
        drop(state);

        let applied = matches!(event, QueueEvent::Completed { .. });
        self.sink.emit(&event);
        Ok(applied)
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        next_delay: Option<Duration>,
    ) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let event = match state.jobs.get_mut(&job_id) {
            Some(job) if job.holds_lease(worker) => match next_delay {
                Some(delay) => {
                    job.schedule_retry(delay, error.to_string(), now);
                    QueueEvent::RetryScheduled {
                        job_id,
                        attempts: job.attempts,
                        delay,
                        error: error.to_string(),
                    }
                }
                None => {
                    job.mark_failed(error.to_string(), now);
                    QueueEvent::Failed {
                        job_id,
                        attempts: job.attempts,
                        error: error.to_string(),
                    }
                }
            },
            _ => QueueEvent::LeaseLost {
                job_id,
                worker: worker.clone(),
            },
        };
        drop(state);

        let applied = !matches!(event, QueueEvent::LeaseLost { .. });
        self.sink.emit(&event);
        Ok(applied)
    }

    async fn renew_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let renewed = match state.jobs.get_mut(&job_id) {
            Some(job) if job.holds_lease(worker) => {
                job.renew_lease(lease, now);
                true
            }
            _ => false,
        };
        drop(state);

        let worker = worker.clone();
        self.sink.emit(&if renewed {
            QueueEvent::LeaseRenewed { job_id, worker }
        } else {
            QueueEvent::LeaseLost { job_id, worker }
        });
        Ok(renewed)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        let state = self.state.lock().await;
        let mut failed: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|job| job.seq);
        failed.truncate(limit);
        Ok(failed)
    }

    async fn requeue_failed(&self, job_id: JobId) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let requeued = match state.jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Failed => {
                job.requeue(now);
                true
            }
            _ => false,
        };
        drop(state);

        if requeued {
            self.sink.emit(&QueueEvent::Requeued { job_id });
        }
        Ok(requeued)
    }

    async fn reap_expired_leases(&self) -> Result<Vec<JobId>, QueueError> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let mut state = self.state.lock().await;
        state.fail_exhausted_leases(now, &mut events);

        let mut released = Vec::new();
        for job in state.jobs.values_mut() {
            if job.lease_expired(now) {
                let previous = job.locked_by.clone();
                job.release_lease(now);
                released.push(job.id);
                events.push(QueueEvent::LeaseExpired {
                    job_id: job.id,
                    previous,
                });
            }
        }
        drop(state);

        self.emit_all(&events);
        Ok(released)
    }
}
