//! Ports - 抽象化レイヤー
//!
//! 外部システム（PostgreSQL、ログ収集、時刻）へのインターフェース。
//! 実装は `impls` に置く。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod queue_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_store::{LEASE_EXPIRED_ON_FINAL_ATTEMPT, QueueCounts, QueueStore};
