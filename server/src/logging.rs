//! Structured logging initialization.
//!
//! Builds the tracing subscriber from [`LoggingConfig`]. The `RUST_LOG`
//! environment variable, when set, overrides the configured level filter.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem. Call once, early.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(&config.level)
    };

    let layer = fmt::layer()
        .with_ansi(config.format != LogFormat::Json)
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    let registry = tracing_subscriber::registry().with(filter);
    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(layer).init(),
        (LogFormat::Pretty, false) => registry.with(layer.without_time()).init(),
        (LogFormat::Json, true) => registry.with(layer.json()).init(),
        (LogFormat::Json, false) => registry.with(layer.json().without_time()).init(),
        (LogFormat::Compact, true) => registry.with(layer.compact()).init(),
        (LogFormat::Compact, false) => registry.with(layer.compact().without_time()).init(),
    }
}
