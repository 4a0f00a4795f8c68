use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "sensor_bridge=info,warn";

/// Initializes logging with a JSON daily-rolling file and a console layer.
///
/// The console layer writes to stderr because stdout carries presentation output.
/// Keep the returned guard alive for the life of the process so buffered lines are flushed.
pub fn init_logging(config: &LoggingConfig) -> WorkerGuard {
    let _ = fs::create_dir_all(&config.dir);

    let file_appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}
