//! WorkerPool - poll → lock → handle → complete / fail
//!
//! - worker 同士は何も共有しない。協調はすべて `QueueStore` 経由
//! - shutdown は「新しい job を取らない」だけ。実行中の job は最後まで走らせる
//! - lease は手放さない。落ちた worker の lease は期限切れで回収される

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::context::JobContext;
use super::reaper::reaper_loop;
use crate::domain::{JobRecord, QueueError, RetryPolicy, WorkerId};
use crate::ports::QueueStore;
use crate::typed::HandlerRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Prefix for worker ids (`<name>-<index>`).
    pub name: String,
    pub concurrency: usize,

    /// Sleep after an empty poll.
    pub poll_interval: Duration,

    /// Random extra sleep in `[0, poll_jitter]` added to each empty-poll sleep.
    pub poll_jitter: Duration,

    pub lease_duration: Duration,

    /// Advisory execution budget, enforced through `JobContext::checkpoint`.
    pub job_timeout: Option<Duration>,

    /// Run a lease reaper alongside the workers.
    pub reap_interval: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "recap".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(250),
            lease_duration: Duration::from_secs(30),
            job_timeout: Some(Duration::from_secs(120)),
            reap_interval: Some(Duration::from_secs(15)),
        }
    }
}

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Jobs taken from the store.
    pub processed: u64,
    pub succeeded: u64,

    /// Failures rescheduled with a backoff delay.
    pub retried: u64,

    /// Terminal failures.
    pub failed: u64,

    /// Jobs abandoned because another worker reclaimed the lease.
    pub lease_lost: u64,

    pub storage_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    lease_lost: AtomicU64,
    storage_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker loop needs. Shared read-only between workers.
struct Shared {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    config: WorkerPoolConfig,
    counters: Counters,
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` workers (plus the reaper, if configured).
    pub fn spawn(
        config: WorkerPoolConfig,
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
    ) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_ids: Vec<WorkerId> = (0..config.concurrency)
            .map(|i| WorkerId::for_pool(&config.name, i))
            .collect();
        let reap_interval = config.reap_interval;

        let shared = Arc::new(Shared {
            store,
            registry,
            policy,
            config,
            counters: Counters::default(),
        });

        let mut joins = Vec::with_capacity(worker_ids.len() + 1);
        for worker in worker_ids.iter().cloned() {
            let shared = Arc::clone(&shared);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker, shared, rx).await;
            }));
        }

        if let Some(interval) = reap_interval {
            let store = Arc::clone(&shared.store);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                reaper_loop(store, interval, rx).await;
            }));
        }

        info!(pool = %shared.config.name, workers = worker_ids.len(), "worker pool started");

        WorkerPoolHandle {
            shutdown_tx,
            joins,
            shared,
            worker_ids,
        }
    }
}

/// Handle to a running pool.
/// - `request_shutdown()`: 新しい job の取得を止める（実行中の job は完走する）
/// - `shutdown_and_join()`: 全 worker の終了を待ち、最終的な `PoolStats` を返す
pub struct WorkerPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    worker_ids: Vec<WorkerId>,
}

impl WorkerPoolHandle {
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop, wait for every worker, and return the final counters
    /// (including jobs that finished during shutdown).
    pub async fn shutdown_and_join(self) -> PoolStats {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
        let stats = self.shared.counters.snapshot();
        info!(pool = %self.shared.config.name, succeeded = stats.succeeded, failed = stats.failed, "worker pool stopped");
        stats
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot()
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }
}

async fn worker_loop(worker: WorkerId, shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    debug!(%worker, "worker started");
    let lease = shared.config.lease_duration;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let job = match shared.store.dequeue_and_lock(&worker, lease).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let pause = shared.config.poll_interval + jitter(shared.config.poll_jitter);
                if sleep_or_shutdown(pause, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                Counters::bump(&shared.counters.storage_errors);
                error!(%worker, error = %e, "dequeue failed");
                if sleep_or_shutdown(shared.config.poll_interval, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        // shutdown is not observed while a job runs
        let span = info_span!(
            "job",
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempts,
            %worker
        );
        run_job(&worker, &shared, job).instrument(span).await;
    }

    debug!(%worker, "worker stopped");
}

async fn run_job(worker: &WorkerId, shared: &Shared, job: JobRecord) {
    let counters = &shared.counters;
    Counters::bump(&counters.processed);

    let Some(handler) = shared.registry.get(&job.kind) else {
        // no handler will ever appear: terminal, no retry
        let err = QueueError::UnknownJobKind(job.kind.clone());
        warn!(error = %err, "unknown job kind");
        report_failure(worker, shared, &job, &err, None).await;
        return;
    };

    let ctx = JobContext::new(
        &job,
        worker.clone(),
        Arc::clone(&shared.store),
        shared.config.lease_duration,
        shared.config.job_timeout,
    );
    let started = Instant::now();
    let result = handler.handle(&ctx, &job.payload).await;
    let result = match (result, shared.config.job_timeout) {
        (Ok(()), Some(limit)) if started.elapsed() > limit => Err(QueueError::TimedOut(limit)),
        (result, _) => result,
    };

    match result {
        Ok(()) => match shared.store.complete(job.id, worker).await {
            Ok(true) => {
                Counters::bump(&counters.succeeded);
                info!(elapsed_ms = elapsed_ms(started), "job completed");
            }
            Ok(false) => {
                Counters::bump(&counters.lease_lost);
                warn!("lease lost before completion; result discarded");
            }
            Err(e) => {
                Counters::bump(&counters.storage_errors);
                error!(error = %e, "complete failed; lease will expire and the job will rerun");
            }
        },
        Err(QueueError::LeaseLost(_)) => {
            Counters::bump(&counters.lease_lost);
            info!("lease lost; abandoning job");
        }
        Err(err) => {
            let delay = if retryable(&err) {
                shared.policy.decide(job.attempts, job.max_attempts).delay()
            } else {
                None
            };
            report_failure(worker, shared, &job, &err, delay).await;
        }
    }
}

/// Handler-side storage errors (e.g. from `checkpoint`) go through the retry
/// policy like any other transient failure.
fn retryable(err: &QueueError) -> bool {
    err.is_retryable() || matches!(err, QueueError::Storage(_))
}

async fn report_failure(
    worker: &WorkerId,
    shared: &Shared,
    job: &JobRecord,
    err: &QueueError,
    delay: Option<Duration>,
) {
    let counters = &shared.counters;
    match shared.store.fail(job.id, worker, &err.to_string(), delay).await {
        Ok(true) => match delay {
            Some(delay) => {
                Counters::bump(&counters.retried);
                warn!(error = %err, delay_ms = duration_ms(delay), "attempt failed; retry scheduled");
            }
            None => {
                Counters::bump(&counters.failed);
                error!(error = %err, attempts = job.attempts, "job failed");
            }
        },
        Ok(false) => {
            Counters::bump(&counters.lease_lost);
            warn!(error = %err, "lease lost before failure could be recorded");
        }
        Err(e) => {
            Counters::bump(&counters.storage_errors);
            error!(error = %e, handler_error = %err, "fail failed; lease will expire and the job will rerun");
        }
    }
}

/// Returns `true` when shutdown was requested (or the pool handle is gone).
async fn sleep_or_shutdown(pause: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
        _ = tokio::time::sleep(pause) => false,
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = duration_ms(max);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bound() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn storage_errors_inside_handlers_are_retried() {
        assert!(retryable(&QueueError::Storage("connection reset".into())));
        assert!(retryable(&QueueError::handler("llm 503")));
        assert!(!retryable(&QueueError::Config("bad".into())));
    }

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move { sleep_or_shutdown(Duration::from_secs(60), &mut rx).await });
        tx.send(true).unwrap();
        assert!(sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn sleep_stops_when_handle_is_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }
}
