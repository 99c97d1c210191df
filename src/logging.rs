//! Logging setup
//!
//! Stderr output for the invoking terminal plus a daily rolling file, so the
//! history of a session spread over several invocations ends up in one place.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_BASENAME: &str = "recsync.log";
const LOG_DIR_ENV: &str = "RECSYNC_LOG_PATH";
const LOG_RETENTION_DAYS: u64 = 7;
const DEFAULT_FILTER: &str = "recsync=info";

/// Install the global subscriber. The returned guard flushes the file writer
/// on drop and must live as long as the process logs.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_dir = resolve_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    prune_old_logs(
        &log_dir,
        Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS),
    );

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn resolve_log_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(LOG_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }

    let proj_dirs = ProjectDirs::from("dev", "recsync", "recsync")
        .context("Failed to determine project directories for log path")?;

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return Ok(PathBuf::from(home).join("Library").join("Logs").join("recsync"));
        }
    }

    let base = proj_dirs
        .state_dir()
        .unwrap_or_else(|| proj_dirs.data_local_dir());
    Ok(base.join("logs"))
}

fn prune_old_logs(log_dir: &Path, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };

    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let file_name = path.file_name().and_then(|name| name.to_str());
        let Some(file_name) = file_name else {
            continue;
        };

        if !file_name.starts_with(LOG_FILE_BASENAME) {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };

        if modified < cutoff {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prune_keeps_recent_and_foreign_files() {
        let dir = tempdir().unwrap();
        let recent = dir.path().join(format!("{LOG_FILE_BASENAME}.2026-10-19"));
        let other = dir.path().join("notes.txt");
        std::fs::write(&recent, "log").unwrap();
        std::fs::write(&other, "keep").unwrap();

        prune_old_logs(dir.path(), Duration::from_secs(3600));

        assert!(recent.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_prune_removes_expired_logs_only() {
        let dir = tempdir().unwrap();
        let log = dir.path().join(format!("{LOG_FILE_BASENAME}.2026-01-01"));
        let other = dir.path().join("notes.txt");
        std::fs::write(&log, "old").unwrap();
        std::fs::write(&other, "keep").unwrap();

        // Everything is older than a zero max age
        std::thread::sleep(Duration::from_millis(20));
        prune_old_logs(dir.path(), Duration::ZERO);

        assert!(!log.exists());
        assert!(other.exists());
    }
}
