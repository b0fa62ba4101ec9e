//! Audio gateway configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default Redis host.
pub const DEFAULT_REDIS_HOST: &str = "127.0.0.1";

/// Default Redis port.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Default media control server URL.
pub const DEFAULT_MCS_URL: &str = "ws://127.0.0.1:8090/mcs";

/// Default base path for audio recordings.
pub const DEFAULT_RECORDING_BASE_PATH: &str = "/var/sfu/recordings";

/// Default media flow watchdog base timeout in milliseconds.
pub const DEFAULT_MEDIA_FLOW_TIMEOUT_MS: u64 = 20_000;

/// Default broker reconnect ceiling in milliseconds (one hour of outage).
pub const DEFAULT_BROKER_RETRY_CEILING_MS: u64 = 3_600_000;

/// Default cap on successful broker connections before giving up.
pub const DEFAULT_BROKER_MAX_CONNECTIONS: u32 = 10;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "audio-gateway";

/// Audio gateway configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis host for both broker connections (default: "127.0.0.1").
    pub redis_host: String,

    /// Redis port (default: 6379).
    pub redis_port: u16,

    /// Optional Redis password.
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_password: Option<SecretString>,

    /// Media control server WebSocket URL (default: "ws://127.0.0.1:8090/mcs").
    pub mcs_url: String,

    /// Whether publisher streams are recorded once media flows.
    pub recording_enabled: bool,

    /// Base directory for recording files.
    pub recording_base_path: String,

    /// Media flow watchdog base timeout in milliseconds.
    pub media_flow_timeout_ms: u64,

    /// Broker reconnect ceiling: give up once an outage lasts longer.
    pub broker_retry_ceiling_ms: u64,

    /// Broker reconnect cap: give up once this many successful connections
    /// have already been consumed.
    pub broker_max_connections: u32,

    /// Unique identifier for this gateway instance.
    pub instance_id: String,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_host", &self.redis_host)
            .field("redis_port", &self.redis_port)
            .field(
                "redis_password",
                &self.redis_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("mcs_url", &self.mcs_url)
            .field("recording_enabled", &self.recording_enabled)
            .field("recording_base_path", &self.recording_base_path)
            .field("media_flow_timeout_ms", &self.media_flow_timeout_ms)
            .field("broker_retry_ceiling_ms", &self.broker_retry_ceiling_ms)
            .field("broker_max_connections", &self.broker_max_connections)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_host = vars
            .get("SFU_REDIS_HOST")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string());

        // A silently wrong port makes the worker deaf, so reject instead of
        // falling back.
        let redis_port = match vars.get("SFU_REDIS_PORT") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "SFU_REDIS_PORT must be a port number, got {raw:?}"
                ))
            })?,
            None => DEFAULT_REDIS_PORT,
        };

        let redis_password = vars
            .get("SFU_REDIS_PASSWORD")
            .filter(|v| !v.is_empty())
            .map(|v| SecretString::from(v.clone()));

        let mcs_url = vars
            .get("SFU_MCS_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MCS_URL.to_string());

        let recording_enabled = vars
            .get("SFU_RECORDING_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let recording_base_path = vars
            .get("SFU_RECORDING_BASE_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RECORDING_BASE_PATH.to_string());

        // Parse watchdog and reconnect tunables
        let media_flow_timeout_ms = vars
            .get("SFU_MEDIA_FLOW_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MEDIA_FLOW_TIMEOUT_MS);

        let broker_retry_ceiling_ms = vars
            .get("SFU_BROKER_RETRY_CEILING_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BROKER_RETRY_CEILING_MS);

        let broker_max_connections = vars
            .get("SFU_BROKER_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BROKER_MAX_CONNECTIONS);

        // Generate instance ID
        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_host,
            redis_port,
            redis_password,
            mcs_url,
            recording_enabled,
            recording_base_path,
            media_flow_timeout_ms,
            broker_retry_ceiling_ms,
            broker_max_connections,
            instance_id,
        })
    }

    /// Redis connection URL for the redis client.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}",
                password.expose_secret(),
                self.redis_host,
                self.redis_port
            ),
            None => format!("redis://{}:{}", self.redis_host, self.redis_port),
        }
    }
}
