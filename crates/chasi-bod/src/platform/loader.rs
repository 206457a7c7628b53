use std::io::ErrorKind;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use super::ConfigError;
use super::PlatformConfig;

/// Reads and parses a platform document. The result is not validated.
///
/// # Errors
///
/// - [`ConfigError::NotFound`] if the file does not exist
/// - [`ConfigError::Io`] if the file cannot be read
/// - [`ConfigError::Parse`] if the content is not a valid document
pub fn load_config(path: &Path) -> Result<PlatformConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        let context = if e.kind() == ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
            }
        };
        Report::new(e).change_context(context)
    })?;

    let config = serde_yaml::from_str(&content).change_context(ConfigError::Parse {
        path: path.to_path_buf(),
    })?;
    debug!(path = %path.display(), "Loaded platform configuration");
    Ok(config)
}

/// Writes a platform document, creating parent directories as needed.
///
/// # Errors
///
/// - [`ConfigError::Parse`] if the document cannot be serialized
/// - [`ConfigError::Io`] if the directory or file cannot be written
pub fn save_config(config: &PlatformConfig, path: &Path) -> Result<(), Report<ConfigError>> {
    let content = serde_yaml::to_string(config).change_context(ConfigError::Parse {
        path: path.to_path_buf(),
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).change_context(ConfigError::Io {
            path: parent.to_path_buf(),
        })?;
    }
    std::fs::write(path, content).change_context(ConfigError::Io {
        path: path.to_path_buf(),
    })?;
    debug!(path = %path.display(), "Saved platform configuration");
    Ok(())
}
