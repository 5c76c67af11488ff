//! Errors from loading and saving the bridge configuration

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicit `--config` path that does not exist
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed bridge config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize bridge config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
