//! Media control plane abstraction.
//!
//! Sessions drive the media server through the [`MediaControl`] trait rather
//! than a concrete client, so tests can substitute an in-process fake. The
//! production implementation lives in [`crate::media::remote`].

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque handle for a joined user on the media server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserHandle(String);

impl UserHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle for a media element (endpoint or recording) on the media
/// server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle(String);

impl MediaHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Endpoint kind requested on publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// WebRTC endpoint negotiated with an SDP offer.
    WebRtc,
    /// Raw RTP endpoint fed by an external producer.
    Rtp,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::WebRtc => "WebRtcEndpoint",
            MediaKind::Rtp => "RtpEndpoint",
        }
    }
}

/// Result of a successful publish or subscribe negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub media: MediaHandle,
    pub answer: String,
}

/// Asynchronous notification about a media element.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Media started or stopped flowing through the element.
    FlowChanged { flowing: bool },
    /// The server gathered an ICE candidate for the element.
    CandidateGathered(serde_json::Value),
    /// Recording element state change, informational only.
    RecordingChanged { state: String },
    /// The control connection is gone; every session is dead.
    ServerOffline,
}

/// Media control plane failure.
#[derive(Debug, Clone, Error)]
pub enum MediaControlError {
    /// The server processed the request and refused it.
    #[error("request failed: {0}")]
    Request(String),

    /// The control connection is down.
    #[error("media control connection lost")]
    Offline,

    /// The server answered with something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Operations a session needs from the media server.
///
/// Implementations must be safe to share across sessions; every method takes
/// `&self` and may be called concurrently.
#[async_trait]
pub trait MediaControl: Send + Sync {
    /// Join a voice bridge, returning the user handle for later operations.
    async fn join(&self, room: &str) -> Result<UserHandle, MediaControlError>;

    /// Publish a stream into the bridge and negotiate the given descriptor.
    async fn publish(
        &self,
        user: &UserHandle,
        room: &str,
        kind: MediaKind,
        descriptor: &str,
    ) -> Result<Negotiated, MediaControlError>;

    /// Subscribe to an existing source and negotiate the given descriptor.
    async fn subscribe(
        &self,
        user: &UserHandle,
        source: &MediaHandle,
        kind: MediaKind,
        descriptor: &str,
    ) -> Result<Negotiated, MediaControlError>;

    /// Relay a client ICE candidate to a media element.
    async fn add_ice_candidate(
        &self,
        media: &MediaHandle,
        candidate: &serde_json::Value,
    ) -> Result<(), MediaControlError>;

    /// Connect a source element to a sink element.
    async fn connect(
        &self,
        source: &MediaHandle,
        sink: &MediaHandle,
    ) -> Result<(), MediaControlError>;

    /// Sever the link between a source element and a sink element.
    async fn disconnect(
        &self,
        source: &MediaHandle,
        sink: &MediaHandle,
    ) -> Result<(), MediaControlError>;

    /// Record a source to the given path, returning the recording handle.
    async fn start_recording(
        &self,
        user: &UserHandle,
        source: &MediaHandle,
        path: &str,
    ) -> Result<MediaHandle, MediaControlError>;

    /// Stop a recording previously started with [`Self::start_recording`].
    async fn stop_recording(
        &self,
        user: &UserHandle,
        recording: &MediaHandle,
    ) -> Result<(), MediaControlError>;

    /// Leave the bridge, releasing every element owned by the user.
    async fn leave(&self, room: &str, user: &UserHandle) -> Result<(), MediaControlError>;

    /// Subscribe to events for a media element.
    ///
    /// The receiver also sees [`MediaEvent::ServerOffline`] when the control
    /// connection dies.
    async fn events(
        &self,
        media: &MediaHandle,
    ) -> Result<mpsc::UnboundedReceiver<MediaEvent>, MediaControlError>;
}
