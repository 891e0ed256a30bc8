//! Structured logging: console plus a daily rolling file under
//! `{data_dir}/logs`, pruned to the newest `MAX_LOG_FILES` files.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, SyncError};

pub const MAX_LOG_FILES: usize = 10;
pub const DEFAULT_FILTER: &str = "info,festival_pos_sync=debug";
const LOG_FILE_PREFIX: &str = "pos-sync";

/// Install the global subscriber. `RUST_LOG` wins over `filter`.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the life of the process.
pub fn init(log_dir: &Path, filter: Option<&str>, json: bool) -> Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_FILTER)))
        .map_err(|e| SyncError::Config(format!("invalid log filter: {e}")))?;

    fs::create_dir_all(log_dir)
        .map_err(|e| SyncError::Config(format!("create log dir {}: {e}", log_dir.display())))?;
    prune_old_logs(log_dir, MAX_LOG_FILES);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (plain_file, json_file) = if json {
        (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true),
            ),
        )
    } else {
        (
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(plain_file)
        .with(json_file)
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging already initialised: {e}")))?;

    Ok(guard)
}

/// Delete all but the `keep` most recently modified log files.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
