//! Gateway error types.
//!
//! Errors that reach a client are reduced to a stable numeric code plus a
//! client-safe reason string. Internal details stay in server-side logs.

use crate::config::ConfigError;
use crate::media::control::MediaControlError;
use crate::messages::Role;
use thiserror::Error;

/// Gateway error type.
///
/// Client-facing code mapping:
/// - `MediaServerOffline`: 2000 `MEDIA_SERVER_OFFLINE`
/// - `MediaControl`: 2003 `MEDIA_SERVER_GENERIC_ERROR`
/// - `AlreadyStarting`, `Broker`, `Config`, `Internal`: 2200 `MEDIA_GENERIC_ERROR`
/// - `Validation`: 2300 `SFU_INVALID_REQUEST`
#[derive(Debug, Error)]
pub enum AudioError {
    /// Request is malformed or names an unknown operation.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A negotiation is already in flight for this session.
    #[error("Session {0} is already being negotiated")]
    AlreadyStarting(String),

    /// The media control server rejected or failed an operation.
    #[error("Media control failure for {role} stream {stream}: {message}")]
    MediaControl {
        role: Role,
        stream: String,
        message: String,
    },

    /// The media control server connection is gone.
    #[error("Media server offline")]
    MediaServerOffline,

    /// Message broker failure.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AudioError {
    /// Wrap a media control failure with session context.
    pub fn media(role: Role, stream: impl Into<String>, err: MediaControlError) -> Self {
        match err {
            MediaControlError::Offline => AudioError::MediaServerOffline,
            other => AudioError::MediaControl {
                role,
                stream: stream.into(),
                message: other.to_string(),
            },
        }
    }

    /// Returns the stable numeric code sent to clients.
    pub fn error_code(&self) -> i32 {
        match self {
            AudioError::MediaServerOffline => 2000,
            AudioError::MediaControl { .. } => 2003,
            AudioError::AlreadyStarting(_)
            | AudioError::Broker(_)
            | AudioError::Config(_)
            | AudioError::Internal(_) => 2200,
            AudioError::Validation(_) => 2300,
        }
    }

    /// Returns a client-safe reason string (no internal details).
    pub fn client_reason(&self) -> &'static str {
        match self {
            AudioError::MediaServerOffline => "MEDIA_SERVER_OFFLINE",
            AudioError::MediaControl { .. } => "MEDIA_SERVER_GENERIC_ERROR",
            AudioError::AlreadyStarting(_)
            | AudioError::Broker(_)
            | AudioError::Config(_)
            | AudioError::Internal(_) => "MEDIA_GENERIC_ERROR",
            AudioError::Validation(_) => "SFU_INVALID_REQUEST",
        }
    }
}
