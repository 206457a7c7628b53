pub mod logging;
pub mod version;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to create log directory `{path}`: {source}")]
    CreateLogDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create rolling file appender in `{path}`: {message}")]
    Appender { path: PathBuf, message: String },

    #[error("Global tracing subscriber already installed")]
    AlreadyInitialized,
}
