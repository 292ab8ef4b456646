//! Catalog loading errors.

use std::path::PathBuf;

use herald_core::HeraldError;

/// Errors raised while loading or watching the endpoint catalog.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse endpoint catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Endpoint(#[from] HeraldError),

    #[error("No catalog path configured")]
    NoPath,

    #[error("File watcher error: {0}")]
    Watch(String),
}
