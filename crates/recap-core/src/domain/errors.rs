//! Errors - エラー型と分類
//!
//! - `Storage`: Queue Store の障害。呼び出し元へそのまま返す（store 内部でリトライしない）
//! - `UnknownJobKind`: handler 未登録。リトライしても解決しないので即 failed
//! - `HandlerFailure` / `TimedOut`: RetryPolicy の判断対象
//! - `LeaseLost`: lease を失った。現在の worker は静かに手を引く

use std::time::Duration;

use thiserror::Error;

use super::ids::JobId;
use super::job::JobKind;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("no handler registered for job kind={0}")]
    UnknownJobKind(JobKind),

    #[error("{0}")]
    HandlerFailure(String),

    #[error("lease lost for {0}")]
    LeaseLost(JobId),

    #[error("execution timeout of {0:?} exceeded")]
    TimedOut(Duration),

    #[error("duplicate handler for job kind={0}")]
    DuplicateHandler(JobKind),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    /// Shorthand for handlers.
    pub fn handler(message: impl Into<String>) -> Self {
        QueueError::HandlerFailure(message.into())
    }

    /// Subject to the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::HandlerFailure(_) | QueueError::TimedOut(_))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(e: config::ConfigError) -> Self {
        QueueError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_handler_failures_and_timeouts_retry() {
        assert!(QueueError::handler("llm 503").is_retryable());
        assert!(QueueError::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(!QueueError::Storage("down".into()).is_retryable());
        assert!(!QueueError::UnknownJobKind(JobKind::new("x")).is_retryable());
    }

    #[test]
    fn handler_failure_displays_bare_message() {
        assert_eq!(QueueError::handler("llm 503").to_string(), "llm 503");
    }
}
