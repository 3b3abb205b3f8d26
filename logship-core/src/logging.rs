//! Logging infrastructure for logship
//!
//! Hosts embedding the channel log to daily files under
//! `~/.local/state/logship/` following XDG standards. The CLI can log to
//! stderr instead.

use crate::config::{Config, LoggingConfig};
use crate::error::Error;
use chrono::Utc;
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const FILE_PREFIX: &str = "logship";
const FILE_SUFFIX: &str = "log";

/// Initialize file logging
///
/// Sets up tracing with:
/// - File output to XDG state directory
/// - Daily rotation, keeping `max_files` files
/// - Configurable log level via config or RUST_LOG env var
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(FILE_PREFIX)
        .filename_suffix(FILE_SUFFIX)
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter(config))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _guard: Some(guard),
    })
}

/// Initialize compact logging to stderr, for interactive commands.
pub fn init_stderr(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let stderr_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter(config))
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    Ok(LoggingGuard { _guard: None })
}

/// Initialize logging for tests (logs to stdout)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// RUST_LOG wins over the configured level.
fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending file writes.
pub struct LoggingGuard {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Returns today's log file path
pub fn log_file_path() -> PathBuf {
    Config::state_dir().join(format!(
        "{}.{}.{}",
        FILE_PREFIX,
        Utc::now().format("%Y-%m-%d"),
        FILE_SUFFIX
    ))
}

/// Mask a secret for log output, keeping only the last four characters.
pub fn redact(secret: &str) -> String {
    let visible = 4;
    let count = secret.chars().count();
    if count <= visible {
        return "*".repeat(count);
    }
    let tail: String = secret.chars().skip(count - visible).collect();
    format!("{}{}", "*".repeat(count - visible), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path_is_dated() {
        let path = log_file_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("logship."));
        assert!(name.ends_with(".log"));
        // logship.YYYY-MM-DD.log
        assert_eq!(name.len(), "logship.".len() + 10 + ".log".len());
        assert!(path.parent().unwrap().ends_with("logship"));
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("abcdef123456"), "********3456");
        assert_eq!(redact("abc"), "***");
        assert_eq!(redact(""), "");
    }
}
