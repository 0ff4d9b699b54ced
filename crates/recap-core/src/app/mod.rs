//! App - アプリケーション層
//!
//! ports を組み合わせて job 実行のロジックを実装する。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: store / handler / pool 設定のワイヤリングと起動時検証
//! - **WorkerPool**: poll → lock → handle → complete / fail のループ
//! - **JobContext**: handler に渡すコンテキスト（lease 延長と timeout 判定）
//! - **Reaper**: lease 期限切れの回収

pub mod builder;
pub mod context;
pub mod reaper;
pub mod worker_pool;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::context::JobContext;
pub use self::worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
