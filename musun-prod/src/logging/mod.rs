//! Logging setup for tracker commands.
//!
//! Console output goes to stderr so that `--json` output on stdout stays
//! machine-readable. An optional log directory adds a daily-rotated file.

use std::path::Path;

use chrono::{Local, Utc};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::utils::fs;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "musun_prod=info,sqlx=warn";

/// File name prefix for rotated log files.
const LOG_FILE_PREFIX: &str = "musun-prod.log";

/// Log retention period in days.
pub const LOG_RETENTION_DAYS: i64 = 14;

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Filter directive for the given command-line verbosity.
///
/// `quiet` wins over `verbose`. With neither, `RUST_LOG` is honoured and
/// [`DEFAULT_LOG_FILTER`] is the fallback.
pub fn filter_directive(verbose: u8, quiet: bool) -> Option<&'static str> {
    match (quiet, verbose) {
        (true, _) => Some("musun_prod=error,sqlx=error"),
        (false, 0) => None,
        (false, 1) => Some("musun_prod=debug,sqlx=warn"),
        (false, _) => Some("musun_prod=trace,sqlx=debug"),
    }
}

fn build_filter(verbose: u8, quiet: bool) -> EnvFilter {
    match filter_directive(verbose, quiet) {
        Some(directive) => EnvFilter::new(directive),
        None => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
        }
    }
}

/// Initialize the global subscriber.
///
/// When `log_dir` is given, the returned guard must be kept alive for the
/// lifetime of the command or buffered file output is lost.
pub fn init_logging(
    verbose: u8,
    quiet: bool,
    log_dir: Option<&Path>,
) -> crate::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            fs::ensure_dir_all_sync(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(verbose, quiet))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose > 0)
                .with_timer(LocalTimer),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(guard)
}

/// Delete rotated log files older than `retention_days`.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old log file")
                }
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }
    Ok(deleted_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("musun_prod=info"));
        assert!(DEFAULT_LOG_FILTER.contains("sqlx=warn"));
    }

    #[test]
    fn test_quiet_overrides_verbose() {
        assert_eq!(filter_directive(2, true), Some("musun_prod=error,sqlx=error"));
        assert_eq!(filter_directive(0, false), None);
        assert_eq!(filter_directive(1, false), Some("musun_prod=debug,sqlx=warn"));
        assert_eq!(filter_directive(5, false), Some("musun_prod=trace,sqlx=debug"));
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_rotated_logs() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("musun-prod.log.2000-01-01");
        let today = dir
            .path()
            .join(format!("musun-prod.log.{}", Utc::now().format("%Y-%m-%d")));
        let unrelated = dir.path().join("notes.2000-01-01");
        for path in [&old, &today, &unrelated] {
            tokio::fs::write(path, b"x").await.unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(!old.exists());
        assert!(today.exists());
        assert!(unrelated.exists());
    }
}
