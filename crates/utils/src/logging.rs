//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

use crate::LoggingError;

/// Environment variable overriding the log directory.
pub const LOG_DIR_ENV_VAR: &str = "CHASI_BOD_LOG_DIR";

/// Prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "chasi-bod.log";

const MAX_LOG_FILES: usize = 3;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Events always go to stderr. When `log_dir` is set, they are also written
/// to a daily rolling file inside it; the returned guard must be held until
/// the process exits so buffered lines are flushed.
///
/// # Errors
///
/// - [`LoggingError::CreateLogDir`] if the log directory cannot be created
/// - [`LoggingError::Appender`] if the rolling appender cannot be built
/// - [`LoggingError::AlreadyInitialized`] if a global subscriber is already set
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, LoggingError> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let Some(log_dir) = log_dir else {
        registry()
            .with(stderr_layer)
            .try_init()
            .map_err(|_| LoggingError::AlreadyInitialized)?;
        return Ok(None);
    };

    let (file_writer, guard) = tracing_appender::non_blocking(rolling_appender(log_dir)?);
    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter());

    registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(Some(guard))
}

fn rolling_appender(log_dir: &Path) -> Result<RollingFileAppender, LoggingError> {
    std::fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateLogDir {
        path: log_dir.to_path_buf(),
        source,
    })?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .map_err(|e| LoggingError::Appender {
            path: log_dir.to_path_buf(),
            message: e.to_string(),
        })
}
