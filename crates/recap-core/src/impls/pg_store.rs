//! PostgreSQL-backed Queue Store.
//!
//! Workers on different machines coordinate through this table only. Every
//! time comparison uses the database `NOW()` so the hosts share one clock.
//!
//! ## Atomicity
//!
//! `dequeue_and_lock` is a single statement: a CTE picks the oldest eligible
//! row with `FOR UPDATE SKIP LOCKED` and the outer `UPDATE ... RETURNING`
//! leases it. Concurrent callers skip rows another transaction already holds,
//! so a job is never handed to two workers.
//!
//! ## Fencing
//!
//! `complete`, `fail` and `renew_lease` carry `state = 'active' AND locked_by = $worker`
//! in their `WHERE` clause. Zero affected rows means the lease was lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::config::QueueConfig;
use crate::domain::{JobId, JobRecord, JobState, NewJob, QueueError, QueueEvent, WorkerId};
use crate::impls::NoopEventSink;
use crate::ports::{
    EventSink, IdGenerator, LEASE_EXPIRED_ON_FINAL_ATTEMPT, QueueCounts, QueueStore, SystemClock,
    UlidGenerator,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS recap_jobs (
        id              TEXT PRIMARY KEY,
        seq             BIGSERIAL NOT NULL,
        kind            TEXT NOT NULL,
        payload         JSONB NOT NULL,
        state           TEXT NOT NULL DEFAULT 'pending'
                        CHECK (state IN ('pending', 'active', 'completed', 'failed')),
        attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts    INTEGER NOT NULL CHECK (max_attempts > 0),
        next_run_at     TIMESTAMPTZ NOT NULL,
        locked_by       TEXT,
        lock_expires_at TIMESTAMPTZ,
        last_error      TEXT,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS recap_jobs_due_idx
        ON recap_jobs (next_run_at, seq)
        WHERE state IN ('pending', 'active')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS recap_jobs_lease_idx
        ON recap_jobs (lock_expires_at)
        WHERE state = 'active'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS recap_jobs_failed_idx
        ON recap_jobs (seq)
        WHERE state = 'failed'
    "#,
];

const JOB_COLUMNS: &str = "j.id, j.seq, j.kind, j.payload, j.state, j.attempts, j.max_attempts, \
     j.next_run_at, j.locked_by, j.lock_expires_at, j.last_error, j.created_at, j.updated_at";

/// Upper bound for delays pushed into `NOW() + interval` (about 100 years).
const MAX_DELAY_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    default_max_attempts: u32,
    sink: Arc<dyn EventSink>,
}

impl PgQueueStore {
    pub fn new(pool: PgPool, config: &QueueConfig) -> Self {
        Self {
            pool,
            default_max_attempts: config.max_attempts,
            sink: Arc::new(NoopEventSink),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        config: &QueueConfig,
    ) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, config))
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the jobs table and its indexes. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), QueueError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Expired leases on the final attempt become failed instead of eligible.
    async fn fail_exhausted_leases(&self) -> Result<(), QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE recap_jobs
            SET state = 'failed',
                last_error = $1,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE state = 'active'
              AND lock_expires_at <= NOW()
              AND attempts >= max_attempts
            RETURNING id, attempts
            "#,
        )
        .bind(LEASE_EXPIRED_ON_FINAL_ATTEMPT)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            self.sink.emit(&QueueEvent::Failed {
                job_id: parse_job_id(row.try_get("id")?)?,
                attempts: to_u32(row.try_get("attempts")?),
                error: LEASE_EXPIRED_ON_FINAL_ATTEMPT.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    #[instrument(skip_all, fields(kind = %job.kind), err)]
    async fn enqueue_job(&self, job: NewJob) -> Result<JobId, QueueError> {
        let max_attempts = job.effective_max_attempts(self.default_max_attempts)?;
        let id = UlidGenerator::new(SystemClock).generate_job_id();

        sqlx::query(
            r#"
            INSERT INTO recap_jobs (id, kind, payload, state, attempts, max_attempts, next_run_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, COALESCE($5, NOW()))
            "#,
        )
        .bind(id.as_ulid().to_string())
        .bind(job.kind.as_str())
        .bind(&job.payload)
        .bind(to_i32(max_attempts))
        .bind(job.run_at)
        .execute(&self.pool)
        .await?;

        self.sink.emit(&QueueEvent::Enqueued { job_id: id, kind: job.kind });
        Ok(id)
    }

    #[instrument(skip_all, fields(%worker), err)]
    async fn dequeue_and_lock(
        &self,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        self.fail_exhausted_leases().await?;

        let sql = format!(
            r#"
            WITH next AS (
                SELECT id, state AS prev_state, locked_by AS prev_owner
                FROM recap_jobs
                WHERE (state = 'pending' AND next_run_at <= NOW())
                   OR (state = 'active' AND lock_expires_at <= NOW() AND attempts < max_attempts)
                ORDER BY next_run_at, seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE recap_jobs j
            SET state = 'active',
                attempts = j.attempts + 1,
                locked_by = $1,
                lock_expires_at = NOW() + ($2::bigint * INTERVAL '1 millisecond'),
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING {JOB_COLUMNS}, next.prev_state, next.prev_owner
            "#
        );

        let row = sqlx::query(&sql)
            .bind(worker.as_str())
            .bind(to_millis(lease))
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job = job_from_row(&row)?;
        let prev_state: String = row.try_get("prev_state")?;
        let prev_owner: Option<String> = row.try_get("prev_owner")?;

        self.sink.emit(&if prev_state == JobState::Active.as_str() {
            QueueEvent::LeaseReclaimed {
                job_id: job.id,
                previous: prev_owner.map(WorkerId::new),
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
        Ok(Some(job))
    }

    #[instrument(skip_all, fields(%job_id, %worker), err)]
    async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<bool, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE recap_jobs
            SET state = 'completed',
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND locked_by = $2
            RETURNING attempts
            "#,
        )
        .bind(job_id.as_ulid().to_string())
        .bind(worker.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let worker = worker.clone();
        match row {
            Some(row) => {
                self.sink.emit(&QueueEvent::Completed {
                    job_id,
                    worker,
                    attempts: to_u32(row.try_get("attempts")?),
                });
                Ok(true)
            }
            None => {
                self.sink.emit(&QueueEvent::LeaseLost { job_id, worker });
                Ok(false)
            }
        }
    }

    #[instrument(skip_all, fields(%job_id, %worker), err)]
    async fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        next_delay: Option<Duration>,
    ) -> Result<bool, QueueError> {
        let query = match next_delay {
            Some(delay) => sqlx::query(
                r#"
                UPDATE recap_jobs
                SET state = 'pending',
                    next_run_at = NOW() + ($4::bigint * INTERVAL '1 millisecond'),
                    last_error = $3,
                    locked_by = NULL,
                    lock_expires_at = NULL,
                    updated_at = NOW()
                WHERE id = $1 AND state = 'active' AND locked_by = $2
                RETURNING attempts
                "#,
            )
            .bind(job_id.as_ulid().to_string())
            .bind(worker.as_str())
            .bind(error)
            .bind(to_millis(delay)),
            None => sqlx::query(
                r#"
                UPDATE recap_jobs
                SET state = 'failed',
                    last_error = $3,
                    locked_by = NULL,
                    lock_expires_at = NULL,
                    updated_at = NOW()
                WHERE id = $1 AND state = 'active' AND locked_by = $2
                RETURNING attempts
                "#,
            )
            .bind(job_id.as_ulid().to_string())
            .bind(worker.as_str())
            .bind(error),
        };

        let Some(row) = query.fetch_optional(&self.pool).await? else {
            self.sink.emit(&QueueEvent::LeaseLost {
                job_id,
                worker: worker.clone(),
            });
            return Ok(false);
        };

        let attempts = to_u32(row.try_get("attempts")?);
        let error = error.to_string();
        self.sink.emit(&match next_delay {
            Some(delay) => QueueEvent::RetryScheduled { job_id, attempts, delay, error },
            None => QueueEvent::Failed { job_id, attempts, error },
        });
        Ok(true)
    }

    #[instrument(skip_all, fields(%job_id, %worker), err)]
    async fn renew_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE recap_jobs
            SET lock_expires_at = NOW() + ($3::bigint * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND locked_by = $2
            "#,
        )
        .bind(job_id.as_ulid().to_string())
        .bind(worker.as_str())
        .bind(to_millis(lease))
        .execute(&self.pool)
        .await?;

        let renewed = result.rows_affected() == 1;
        let worker = worker.clone();
        self.sink.emit(&if renewed {
            QueueEvent::LeaseRenewed { job_id, worker }
        } else {
            QueueEvent::LeaseLost { job_id, worker }
        });
        Ok(renewed)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM recap_jobs j WHERE j.id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_ulid().to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM recap_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = usize::try_from(row.try_get::<i64, _>("n")?).unwrap_or(0);
            match parse_state(&state)? {
                JobState::Pending => counts.pending = n,
                JobState::Active => counts.active = n,
                JobState::Completed => counts.completed = n,
                JobState::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM recap_jobs j WHERE j.state = 'failed' ORDER BY j.seq LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip_all, fields(%job_id), err)]
    async fn requeue_failed(&self, job_id: JobId) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE recap_jobs
            SET state = 'pending',
                attempts = 0,
                next_run_at = NOW(),
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'failed'
            "#,
        )
        .bind(job_id.as_ulid().to_string())
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected() == 1;
        if requeued {
            self.sink.emit(&QueueEvent::Requeued { job_id });
        }
        Ok(requeued)
    }

    #[instrument(skip(self), err)]
    async fn reap_expired_leases(&self) -> Result<Vec<JobId>, QueueError> {
        self.fail_exhausted_leases().await?;

        let rows = sqlx::query(
            r#"
            WITH expired AS (
                SELECT id, locked_by
                FROM recap_jobs
                WHERE state = 'active' AND lock_expires_at <= NOW()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE recap_jobs j
            SET state = 'pending',
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = NOW()
            FROM expired
            WHERE j.id = expired.id
            RETURNING j.id, expired.locked_by AS previous
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut released = Vec::with_capacity(rows.len());
        for row in rows {
            let job_id = parse_job_id(row.try_get("id")?)?;
            let previous: Option<String> = row.try_get("previous")?;
            self.sink.emit(&QueueEvent::LeaseExpired {
                job_id,
                previous: previous.map(WorkerId::new),
            });
            released.push(job_id);
        }
        Ok(released)
    }
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, QueueError> {
    let locked_by: Option<String> = row.try_get("locked_by")?;
    let state: String = row.try_get("state")?;
    let kind: String = row.try_get("kind")?;

    Ok(JobRecord {
        id: parse_job_id(row.try_get("id")?)?,
        seq: u64::try_from(row.try_get::<i64, _>("seq")?).unwrap_or(0),
        kind: kind.as_str().into(),
        payload: row.try_get("payload")?,
        state: parse_state(&state)?,
        attempts: to_u32(row.try_get("attempts")?),
        max_attempts: to_u32(row.try_get("max_attempts")?),
        next_run_at: row.try_get::<DateTime<Utc>, _>("next_run_at")?,
        locked_by: locked_by.map(WorkerId::new),
        lock_expires_at: row.try_get("lock_expires_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_job_id(raw: String) -> Result<JobId, QueueError> {
    raw.parse()
        .map_err(|e| QueueError::Storage(format!("corrupt job id {raw:?}: {e}")))
}

fn parse_state(raw: &str) -> Result<JobState, QueueError> {
    raw.parse()
        .map_err(|e| QueueError::Storage(format!("corrupt job state: {e}")))
}

fn to_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX).min(MAX_DELAY_MS)
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_u32(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}
