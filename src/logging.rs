//! Tracing setup: a daily log file under the data directory.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `rentsync=debug`.
pub const LOG_ENV: &str = "RENTSYNC_LOG";

pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("rentsync").join("logs"))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered lines are lost.
pub fn init(log_dir: Option<&Path>) -> Result<WorkerGuard> {
  let dir = match log_dir {
    Some(d) => d.to_path_buf(),
    None => default_log_dir().ok_or_else(|| eyre!("Could not determine log directory"))?,
  };
  std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "rentsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
