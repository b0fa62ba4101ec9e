//! Supervisor configuration.
//!
//! Configuration is loaded from environment variables.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default worker binaries launched by the supervisor, comma separated.
pub const DEFAULT_WORKER_PATHS: &str = "audio-gateway";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8085";

/// Default grace period for worker shutdown in milliseconds.
pub const DEFAULT_WORKER_GRACE_MS: u64 = 5_000;

/// Supervisor configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker binary paths, launched in configured order.
    pub worker_paths: Vec<String>,

    /// Bind address for the liveness/readiness endpoints.
    pub health_bind_address: String,

    /// How long a worker gets to exit after SIGTERM before it is killed.
    pub worker_grace_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl SupervisorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let raw_paths = vars
            .get("SFU_WORKER_PATHS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_WORKER_PATHS.to_string());

        let worker_paths: Vec<String> = raw_paths
            .split(',')
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect();

        // A supervisor with nothing to supervise is a deployment mistake.
        if worker_paths.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_WORKER_PATHS must name at least one worker, got {raw_paths:?}"
            )));
        }

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let worker_grace_ms = vars
            .get("SFU_WORKER_GRACE_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WORKER_GRACE_MS);

        Ok(SupervisorConfig {
            worker_paths,
            health_bind_address,
            worker_grace_ms,
        })
    }

    /// Worker shutdown grace period as a [`Duration`].
    pub fn worker_grace(&self) -> Duration {
        Duration::from_millis(self.worker_grace_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = HashMap::new();

        let config = SupervisorConfig::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.worker_paths, vec!["audio-gateway".to_string()]);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.worker_grace_ms, DEFAULT_WORKER_GRACE_MS);
        assert_eq!(config.worker_grace(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_from_vars_parses_comma_separated_workers() {
        let vars = HashMap::from([(
            "SFU_WORKER_PATHS".to_string(),
            "/usr/bin/audio-gateway, /usr/bin/video-gateway,".to_string(),
        )]);

        let config = SupervisorConfig::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(
            config.worker_paths,
            vec![
                "/usr/bin/audio-gateway".to_string(),
                "/usr/bin/video-gateway".to_string(),
            ]
        );
    }

    #[test]
    fn test_from_vars_rejects_empty_worker_list() {
        let vars = HashMap::from([("SFU_WORKER_PATHS".to_string(), " , ,".to_string())]);

        let result = SupervisorConfig::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("SFU_WORKER_PATHS"))
        );
    }

    #[test]
    fn test_invalid_grace_falls_back_to_default() {
        let vars = HashMap::from([("SFU_WORKER_GRACE_MS".to_string(), "forever".to_string())]);

        let config = SupervisorConfig::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.worker_grace_ms, DEFAULT_WORKER_GRACE_MS);
    }
}
