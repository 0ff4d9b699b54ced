//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install the process-wide subscriber.
///
/// `RUST_LOG` wins over `config.level`. Safe to call multiple times
/// (subsequent calls are no-ops).
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if config.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.with_target(true).try_init()
    };
}
