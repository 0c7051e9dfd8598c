//! Tracing setup. Logs go to a daily rolling file so command output stays clean.

use color_eyre::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "spendsync.log";

/// Install the global subscriber. `RUST_LOG` wins over `default_directive`.
///
/// The returned guard flushes the file writer on drop and must be held until exit.
pub fn init(log_dir: &Path, default_directive: &str, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)?;

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_directive))?;
  let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
  let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).compact());

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .try_init()?;

  Ok(guard)
}
