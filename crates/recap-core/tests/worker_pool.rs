use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use recap_core::app::{AppBuilder, JobContext, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
use recap_core::domain::{JobId, JobKind, JobRecord, JobState, NewJob, QueueError, RetryPolicy, WorkerId};
use recap_core::impls::{InMemoryQueueStore, MemoryEventSink};
use recap_core::ports::{QueueCounts, QueueStore};
use recap_core::typed::{Handler, HandlerRegistry, JobHandler, QueueStoreExt, SummarizeMeeting};

const WAIT: Duration = Duration::from_secs(5);

fn pool_config(concurrency: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        name: "test".to_string(),
        concurrency,
        poll_interval: Duration::from_millis(5),
        poll_jitter: Duration::from_millis(2),
        lease_duration: Duration::from_secs(5),
        job_timeout: None,
        reap_interval: None,
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::exponential(Duration::from_millis(5))
}

fn spawn(
    config: WorkerPoolConfig,
    store: &Arc<dyn QueueStore>,
    registry: HandlerRegistry,
) -> WorkerPoolHandle {
    WorkerPool::spawn(config, Arc::clone(store), Arc::new(registry), fast_policy())
}

async fn wait_for_terminal(store: &Arc<dyn QueueStore>, id: JobId) -> JobRecord {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let job = store.get(id).await.unwrap().unwrap();
        if job.state.is_terminal() {
            return job;
        }
        assert!(tokio::time::Instant::now() < deadline, "job {id} stuck in {}", job.state);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_drain(store: &Arc<dyn QueueStore>) -> QueueCounts {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let counts = store.counts().await.unwrap();
        if counts.is_drained() {
            return counts;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue not drained: {counts:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Fails every attempt before `succeed_on`.
struct Flaky {
    succeed_on: u32,
}

impl Flaky {
    fn new(succeed_on: u32) -> Self {
        Self { succeed_on }
    }
}

#[async_trait]
impl Handler<SummarizeMeeting> for Flaky {
    async fn handle(&self, ctx: &JobContext, task: SummarizeMeeting) -> Result<(), QueueError> {
        if ctx.attempt() < self.succeed_on {
            return Err(QueueError::handler(format!(
                "llm unavailable for {} (attempt {})",
                task.meeting_id,
                ctx.attempt()
            )));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fails_twice_then_succeeds() {
    let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
    let mut registry = HandlerRegistry::new();
    registry.register_typed::<SummarizeMeeting, _>(Flaky::new(3)).unwrap();

    let id = store.enqueue_task(&SummarizeMeeting::new("m1")).await.unwrap();
    let pool = spawn(pool_config(1), &store, registry);

    let job = wait_for_terminal(&store, id).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("llm unavailable for m1 (attempt 2)"));

    wait_until(|| pool.stats().succeeded == 1).await;
    let stats = pool.stats();
    assert_eq!((stats.processed, stats.retried, stats.succeeded, stats.failed), (3, 2, 1, 0));
    pool.shutdown_and_join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fails_every_attempt_then_gives_up() {
    let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
    let mut registry = HandlerRegistry::new();
    registry.register_typed::<SummarizeMeeting, _>(Flaky::new(u32::MAX)).unwrap();

    let id = store.enqueue_task(&SummarizeMeeting::new("m1")).await.unwrap();
    let pool = spawn(pool_config(2), &store, registry);

    let job = wait_for_terminal(&store, id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("llm unavailable for m1 (attempt 3)"));
    assert_eq!(job.locked_by, None);

    // terminal: it stays failed and visible
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Failed);
    assert_eq!(store.list_failed(10).await.unwrap().len(), 1);

    wait_until(|| pool.stats().failed == 1).await;
    assert_eq!(pool.stats().retried, 2);
    pool.shutdown_and_join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_kind_fails_without_retry() {
    let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
    let id = store
        .enqueue(JobKind::new("render_pdf"), serde_json::json!({ "meetingId": "m1" }))
        .await
        .unwrap();
    let pool = spawn(pool_config(1), &store, HandlerRegistry::new());

    let job = wait_for_terminal(&store, id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(
        job.last_error.as_deref(),
        Some("no handler registered for job kind=render_pdf")
    );
    assert_eq!(pool.stats().retried, 0);
    pool.shutdown_and_join().await;
}

/// First attempt outlives its lease, then checks in.
struct Stalls {
    stall: Duration,
}

#[async_trait]
impl Handler<SummarizeMeeting> for Stalls {
    async fn handle(&self, ctx: &JobContext, _task: SummarizeMeeting) -> Result<(), QueueError> {
        if ctx.attempt() == 1 {
            tokio::time::sleep(self.stall).await;
            ctx.checkpoint().await?;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_lease_is_reclaimed_and_stale_worker_backs_off() {
    let sink = Arc::new(MemoryEventSink::new());
    let store: Arc<dyn QueueStore> =
        Arc::new(InMemoryQueueStore::default().with_event_sink(sink.clone()));
    let mut registry = HandlerRegistry::new();
    registry
        .register_typed::<SummarizeMeeting, _>(Stalls {
            stall: Duration::from_millis(200),
        })
        .unwrap();

    let id = store.enqueue_task(&SummarizeMeeting::new("m1")).await.unwrap();
    let config = WorkerPoolConfig {
        lease_duration: Duration::from_millis(50),
        ..pool_config(2)
    };
    let pool = spawn(config, &store, registry);

    let job = wait_for_terminal(&store, id).await;
    assert_eq!(job.state, JobState::Completed);
    // the reclaim counts as a new attempt
    assert_eq!(job.attempts, 2);

    wait_until(|| pool.stats().lease_lost == 1).await;
    let stats = pool.stats();
    assert_eq!((stats.processed, stats.succeeded, stats.failed), (2, 1, 0));
    assert!(sink.names().contains(&"lease_reclaimed"));
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Completed);
    pool.shutdown_and_join().await;
}

/// Signals when it starts, then takes a while.
struct Slow {
    started: Arc<Notify>,
    duration: Duration,
}

#[async_trait]
impl JobHandler for Slow {
    async fn handle(&self, _ctx: &JobContext, _payload: &serde_json::Value) -> Result<(), QueueError> {
        self.started.notify_one();
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_lets_the_running_job_finish() {
    let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
    let started = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "summarize",
            Arc::new(Slow {
                started: Arc::clone(&started),
                duration: Duration::from_millis(100),
            }),
        )
        .unwrap();

    let running = store.enqueue_task(&SummarizeMeeting::new("m1")).await.unwrap();
    let pool = spawn(pool_config(1), &store, registry);

    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    let queued = store.enqueue_task(&SummarizeMeeting::new("m2")).await.unwrap();
    let before = pool.stats();
    let stats = pool.shutdown_and_join().await;

    assert_eq!(store.get(running).await.unwrap().unwrap().state, JobState::Completed);
    // the job that finished during shutdown is in the returned counters
    assert_eq!(before.succeeded, 0);
    assert_eq!((stats.processed, stats.succeeded), (1, 1));
    // nothing new was taken after the stop signal
    let untouched = store.get(queued).await.unwrap().unwrap();
    assert_eq!((untouched.state, untouched.attempts), (JobState::Pending, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overrunning_handler_is_a_timeout_failure() {
    let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            "summarize",
            Arc::new(Slow {
                started: Arc::new(Notify::new()),
                duration: Duration::from_millis(80),
            }),
        )
        .unwrap();

    let id = store
        .enqueue_job(NewJob::new("summarize", serde_json::json!({ "meetingId": "m1" })).with_max_attempts(1))
        .await
        .unwrap();
    let config = WorkerPoolConfig {
        job_timeout: Some(Duration::from_millis(20)),
        ..pool_config(1)
    };
    let pool = spawn(config, &store, registry);

    let job = wait_for_terminal(&store, id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("execution timeout"));
    pool.shutdown_and_join().await;
}

/// Records which jobs it ran.
struct Recorder {
    seen: Mutex<Vec<JobId>>,
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, ctx: &JobContext, _payload: &serde_json::Value) -> Result<(), QueueError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.seen.lock().unwrap().push(ctx.job_id());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_workers_run_each_job_once() {
    let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
    let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
    let mut registry = HandlerRegistry::new();
    registry.register("summarize", recorder.clone()).unwrap();

    let mut ids = HashSet::new();
    for i in 0..40 {
        ids.insert(
            store
                .enqueue_task(&SummarizeMeeting::new(format!("m{i}")))
                .await
                .unwrap(),
        );
    }
    let pool = spawn(pool_config(6), &store, registry);

    let counts = wait_for_drain(&store).await;
    assert_eq!(counts.completed, 40);
    pool.shutdown_and_join().await;

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 40);
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), ids);
}

/// Fails the first `failures` dequeues, then delegates.
struct UnreliableStore {
    inner: InMemoryQueueStore,
    failures: AtomicU32,
}

#[async_trait]
impl QueueStore for UnreliableStore {
    async fn enqueue_job(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.inner.enqueue_job(job).await
    }

    async fn dequeue_and_lock(
        &self,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(QueueError::Storage("connection refused".to_string()));
        }
        self.inner.dequeue_and_lock(worker, lease).await
    }

    async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<bool, QueueError> {
        self.inner.complete(job_id, worker).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        next_delay: Option<Duration>,
    ) -> Result<bool, QueueError> {
        self.inner.fail(job_id, worker, error, next_delay).await
    }

    async fn renew_lease(&self, job_id: JobId, worker: &WorkerId, lease: Duration) -> Result<bool, QueueError> {
        self.inner.renew_lease(job_id, worker, lease).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError> {
        self.inner.get(job_id).await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.inner.counts().await
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        self.inner.list_failed(limit).await
    }

    async fn requeue_failed(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.inner.requeue_failed(job_id).await
    }

    async fn reap_expired_leases(&self) -> Result<Vec<JobId>, QueueError> {
        self.inner.reap_expired_leases().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_errors_do_not_kill_workers() {
    let store: Arc<dyn QueueStore> = Arc::new(UnreliableStore {
        inner: InMemoryQueueStore::default(),
        failures: AtomicU32::new(3),
    });
    let mut registry = HandlerRegistry::new();
    registry.register_typed::<SummarizeMeeting, _>(Flaky::new(1)).unwrap();

    let id = store.enqueue_task(&SummarizeMeeting::new("m1")).await.unwrap();
    let pool = spawn(pool_config(1), &store, registry);

    let job = wait_for_terminal(&store, id).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(pool.stats().storage_errors, 3);
    pool.shutdown_and_join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn app_builder_wires_and_starts_the_pool() {
    let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
    let app = AppBuilder::new()
        .store(Arc::clone(&store))
        .register::<SummarizeMeeting, _>(Flaky::new(2))
        .unwrap()
        .expect_kinds(&["summarize"])
        .pool_config(pool_config(2))
        .retry_policy(fast_policy())
        .build()
        .unwrap();

    let a = store.enqueue_task(&SummarizeMeeting::new("a")).await.unwrap();
    let b = store.enqueue_task(&SummarizeMeeting::new("b")).await.unwrap();
    let pool = app.start();
    assert_eq!(
        pool.worker_ids(),
        &[WorkerId::new("test-0"), WorkerId::new("test-1")]
    );

    for id in [a, b] {
        let job = wait_for_terminal(&store, id).await;
        assert_eq!((job.state, job.attempts), (JobState::Completed, 2));
    }
    pool.shutdown_and_join().await;
}
