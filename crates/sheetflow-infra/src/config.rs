//! Engine configuration loader.
//!
//! Reads an `EngineConfig` from TOML. Keys may be snake_case or camelCase;
//! missing keys take their defaults. The lenient loader never fails, the
//! strict one reports read and parse errors to the caller.

use std::path::{Path, PathBuf};

use sheetflow_types::config::EngineConfig;
use thiserror::Error;

/// Directory under the user's home holding sheetflow files.
const DATA_DIR_NAME: &str = ".sheetflow";

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration in {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// `~/.sheetflow/config.toml`, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DATA_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load configuration from `path`.
///
/// - Missing file: defaults.
/// - Unreadable, malformed or invalid file: a warning is logged and the
///   defaults are returned.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    match load_engine_config_strict(path).await {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    }
}

/// Load configuration from `path`, failing on any read, parse or
/// validation error.
pub async fn load_engine_config_strict(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let config: EngineConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    config.validate().map_err(|reason| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason,
    })?;

    tracing::debug!(
        path = %path.display(),
        max_concurrency = config.max_concurrency,
        "configuration loaded"
    );
    Ok(config)
}
