//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryQueueStore**: 開発・テスト用の正本（単一プロセス内）
//! - **PgQueueStore**: 本番用。PostgreSQL の `FOR UPDATE SKIP LOCKED` で複数プロセスから安全に dequeue
//! - **TracingEventSink / MemoryEventSink / NoopEventSink**: 状態遷移イベントの出力先

pub mod event_sink;
pub mod memory_store;
pub mod pg_store;

pub use self::event_sink::{MemoryEventSink, NoopEventSink, TracingEventSink};
pub use self::memory_store::InMemoryQueueStore;
pub use self::pg_store::PgQueueStore;
