//! recap-core
//!
//! Background job core for meeting summarization: a durable queue with
//! leases, a worker pool, and exponential retry/backoff.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job record, state, retry decision, errors, events）
//! - **ports**: 抽象化レイヤー（QueueStore, Clock, IdGenerator, EventSink）
//! - **impls**: 実装（InMemoryQueueStore, PgQueueStore, event sinks）
//! - **typed**: 型付き Task API（Task trait, Handler trait, HandlerRegistry）
//! - **app**: アプリケーションロジック（builder, worker pool, reaper）
//! - **config** / **observability**: 設定の読み込みと tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use crate::app::{App, AppBuilder, BuildError, JobContext, PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use crate::config::RecapConfig;
pub use crate::domain::{JobId, JobKind, JobRecord, JobState, NewJob, QueueError, RetryDecision, RetryPolicy, WorkerId};
pub use crate::ports::QueueStore;
pub use crate::typed::{Handler, HandlerRegistry, JobHandler, QueueStoreExt, SummarizeMeeting, Task};
