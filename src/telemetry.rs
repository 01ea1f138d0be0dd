//! C0: process-wide tracing subscriber setup.
//!
//! Ground: `turbomcp-server::logging` — stderr-only logging needs no
//! guard, file-based logging returns a [`TelemetryGuard`] that must be
//! held for the program's lifetime to flush buffered writes on drop.

use std::io;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Retention window for rotated log files (spec.md §6: "retained 30 days,
/// best-effort cleanup"). Enforced by [`cleanup_old_logs`].
const LOG_RETENTION_DAYS: u64 = 30;

/// Guard that must be held for the life of the process when file logging
/// is enabled; dropping it flushes the non-blocking writer.
#[derive(Debug)]
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global tracing subscriber.
///
/// Verbosity is controlled by `RUST_LOG` / `MCP_GATEWAY_LOG`, falling back
/// to `info` when neither is set. If `log_dir` is provided, logs are
/// additionally written to a daily-rotating file under that directory
/// (ground: `turbomcp-server::logging::init_file_only`/`init_both`).
pub fn init(log_dir: Option<&PathBuf>) -> io::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_env("MCP_GATEWAY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(true);

    match log_dir {
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            Ok(TelemetryGuard { _file_guard: None })
        }
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "mcp-gateway");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

            cleanup_old_logs(dir);
            Ok(TelemetryGuard { _file_guard: Some(guard) })
        }
    }
}

/// Best-effort removal of rotated log files older than the retention
/// window. Failures (permission errors, concurrent deletion) are logged
/// and otherwise ignored; log cleanup never blocks startup.
fn cleanup_old_logs(dir: &PathBuf) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);

    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        if metadata.is_file() && modified < cutoff {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::debug!(path = ?entry.path(), error = %e, "log cleanup: failed to remove stale file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_removes_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("mcp-gateway.2020-01-01");
        std::fs::write(&old_path, b"old").unwrap();
        let old_time = std::time::SystemTime::now() - std::time::Duration::from_secs(60 * 60 * 24 * 40);
        let old_file = std::fs::File::open(&old_path).unwrap();
        old_file.set_modified(old_time).ok();

        let fresh_path = dir.path().join("mcp-gateway.today");
        std::fs::write(&fresh_path, b"fresh").unwrap();

        cleanup_old_logs(&dir.path().to_path_buf());

        assert!(!old_path.exists());
        assert!(fresh_path.exists());
    }
}
