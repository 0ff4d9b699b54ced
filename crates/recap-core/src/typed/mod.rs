//! Typed - 型付き Task API
//!
//! job kind の typo を型で排除し、payload と handler の対応付けを静的に保証する。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait, `QueueStoreExt::enqueue_task`
//! - **内部（Dyn）**: `JobHandler` trait - object-safe, `HandlerRegistry` に格納

pub mod handler;
pub mod producer;
pub mod registry;
pub mod task;

pub use self::handler::{Handler, JobHandler, TypedHandler};
pub use self::producer::{QueueStoreExt, new_job};
pub use self::registry::HandlerRegistry;
pub use self::task::{SummarizeMeeting, Task};
