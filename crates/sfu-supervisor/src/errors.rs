//! Error types for the supervisor.

use crate::config::ConfigError;
use thiserror::Error;

/// Errors raised while launching or supervising workers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn worker {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Health server error: {0}")]
    Health(#[source] std::io::Error),
}
