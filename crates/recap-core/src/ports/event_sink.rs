//! EventSink port - 状態遷移イベントの記録
//!
//! 送信先やフォーマットは実装側の関心事。core は emit するだけ。
//!
//! # 実装
//! - `TracingEventSink`: tracing の構造化ログとして出力
//! - `MemoryEventSink`: テスト用に記録
//! - `NoopEventSink`: 何もしない

use std::sync::Arc;

use crate::domain::QueueEvent;

/// Must not block: called on the worker's path, after the store has
/// released its lock.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &QueueEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: &QueueEvent) {
        (**self).emit(event)
    }
}
