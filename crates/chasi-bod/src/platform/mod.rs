//! Platform desired state: document model, loading and validation.

pub mod loader;
pub mod model;
pub mod topology;
pub mod validator;

use core::error::Error;
use std::path::PathBuf;

pub use loader::load_config;
pub use loader::save_config;
pub use model::*;
pub use validator::validate_config;

/// Default location of the platform document.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/chasi-bod/config.yaml";

/// Errors raised while loading, saving or validating a platform document.
#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Configuration file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[display("Failed to access configuration file {}", path.display())]
    Io { path: PathBuf },
    #[display("Failed to parse configuration file {}", path.display())]
    Parse { path: PathBuf },
    #[display("Invalid configuration: {message}")]
    Validation { message: String },
}

impl Error for ConfigError {}

/// Path of the last successfully applied document next to `config_path`.
pub fn current_config_path(config_path: &std::path::Path) -> PathBuf {
    sibling_path(config_path, "current")
}

/// Path of the deployment state record next to `config_path`.
pub fn state_path(config_path: &std::path::Path) -> PathBuf {
    sibling_path(config_path, "state")
}

fn sibling_path(config_path: &std::path::Path, infix: &str) -> PathBuf {
    let stem = config_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    config_path.with_file_name(format!("{stem}.{infix}.yaml"))
}
