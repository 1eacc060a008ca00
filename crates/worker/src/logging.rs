//! Worker logging setup.
//!
//! Foreground mode logs to the console with ANSI colors; background mode
//! writes to a rolling file via a non-blocking appender. The returned guard
//! must be kept alive for the life of the process or buffered lines are
//! lost on exit.

use std::path::PathBuf;

use docpipe_core::config::WorkerConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "docpipe-worker.log";

fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Initialize logging per worker config. `RUST_LOG` overrides the
/// configured level.
pub fn init_worker_logging(config: &WorkerConfig) -> Option<WorkerGuard> {
  let level = parse_log_level(&config.log_level);
  let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

  if config.foreground {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  }

  let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("logs"));
  if std::fs::create_dir_all(&log_dir).is_err() {
    // Fall back to console logging rather than failing startup
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    return None;
  }

  let file_appender = match config.log_rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(&log_dir, LOG_FILE),
    "never" => tracing_appender::rolling::never(&log_dir, LOG_FILE),
    _ => tracing_appender::rolling::daily(&log_dir, LOG_FILE),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
