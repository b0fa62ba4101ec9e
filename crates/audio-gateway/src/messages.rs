//! Wire types for the Redis signaling surface.
//!
//! Inbound control messages arrive on channels matching [`TO_AUDIO_PATTERN`]
//! and are deserialized into [`ControlMessage`]. Outbound client events are
//! serialized from [`ClientEvent`] and published on [`FROM_AUDIO_CHANNEL`].
//! Recording lifecycle notifications go to [`MEETING_EVENTS_CHANNEL`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pattern subscribed for inbound control messages.
pub const TO_AUDIO_PATTERN: &str = "to-sfu-audio*";

/// Channel for outbound client events.
pub const FROM_AUDIO_CHANNEL: &str = "from-sfu-audio";

/// Channel for meeting-level notifications (recording lifecycle).
pub const MEETING_EVENTS_CHANNEL: &str = "meeting-events";

/// Media type tag stamped on every outbound client event.
pub const MEDIA_TYPE: &str = "audio";

/// Session role: publishers share media into the bridge, viewers receive it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publisher of an audio stream.
    #[default]
    Share,
    /// Receive-only subscriber of an audio stream.
    Viewer,
}

impl Role {
    /// True for the publishing side of a stream.
    pub fn is_shared(self) -> bool {
        matches!(self, Role::Share)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Share => "share",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one signaling session.
///
/// A session is keyed by the client connection, the stream it concerns and
/// the role the client takes on that stream. The same client may hold a
/// publisher and any number of viewer sessions concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub connection_id: String,
    pub stream_id: String,
    pub role: Role,
}

impl SessionKey {
    pub fn new(
        connection_id: impl Into<String>,
        stream_id: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            stream_id: stream_id.into(),
            role,
        }
    }

    /// Stream name used in logs and client-facing identifiers.
    pub fn stream_name(&self) -> String {
        format!("{}{}-{}", self.connection_id, self.stream_id, self.role)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}", self.connection_id, self.stream_id, self.role)
    }
}

/// Inbound control message from a client-facing gateway.
///
/// All fields except `id` are optional on the wire; operations validate the
/// fields they need and the router drops messages missing a stream identifier.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Operation name: start, publish, stop, pause, onIceCandidate, close.
    pub id: String,

    #[serde(default)]
    pub connection_id: String,

    /// Stream identifier. Absent only on connection-scoped operations.
    #[serde(default)]
    pub camera_id: Option<String>,

    #[serde(default)]
    pub role: Role,

    #[serde(default)]
    pub sdp_offer: Option<String>,

    #[serde(default)]
    pub candidate: Option<serde_json::Value>,

    /// Pause flag carried by the pause operation.
    #[serde(default)]
    pub state: Option<bool>,

    #[serde(default)]
    pub meeting_id: Option<String>,

    #[serde(default)]
    pub voice_bridge: Option<String>,
}

impl ControlMessage {
    /// Session key for this message, if it names a stream.
    pub fn session_key(&self) -> Option<SessionKey> {
        self.camera_id
            .as_ref()
            .map(|stream| SessionKey::new(self.connection_id.clone(), stream.clone(), self.role))
    }
}

/// Outbound event for a client, published on [`FROM_AUDIO_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEvent {
    pub connection_id: String,

    #[serde(rename = "type")]
    pub media_type: &'static str,

    pub role: Role,

    /// Event name: startResponse, iceCandidate, playStart, playStop,
    /// publish, error.
    pub id: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_answer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ClientEvent {
    fn base(connection_id: &str, role: Role, id: &'static str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            media_type: MEDIA_TYPE,
            role,
            id,
            camera_id: None,
            sdp_answer: None,
            candidate: None,
            response: None,
            meeting_id: None,
            code: None,
            reason: None,
        }
    }

    /// Successful negotiation answer for a start request.
    pub fn start_response(
        connection_id: &str,
        role: Role,
        stream_id: &str,
        sdp_answer: &str,
    ) -> Self {
        let mut event = Self::base(connection_id, role, "startResponse");
        event.camera_id = Some(stream_id.to_string());
        event.sdp_answer = Some(sdp_answer.to_string());
        event
    }

    /// Server-side ICE candidate relayed to the client.
    pub fn ice_candidate(
        connection_id: &str,
        role: Role,
        stream_id: &str,
        candidate: serde_json::Value,
    ) -> Self {
        let mut event = Self::base(connection_id, role, "iceCandidate");
        event.camera_id = Some(stream_id.to_string());
        event.candidate = Some(candidate);
        event
    }

    /// Media is flowing; the client may unmute its UI.
    pub fn play_start(connection_id: &str, role: Role, stream_id: &str) -> Self {
        let mut event = Self::base(connection_id, role, "playStart");
        event.camera_id = Some(stream_id.to_string());
        event
    }

    /// Media stopped flowing and did not recover within the watchdog window.
    pub fn play_stop(connection_id: &str, role: Role, stream_id: &str) -> Self {
        let mut event = Self::base(connection_id, role, "playStop");
        event.camera_id = Some(stream_id.to_string());
        event
    }

    /// Acceptance of an external feed publish request.
    pub fn publish_accepted(connection_id: &str, meeting_id: Option<&str>, answer: &str) -> Self {
        let mut event = Self::base(connection_id, Role::Share, "publish");
        event.response = Some("accepted");
        event.meeting_id = meeting_id.map(str::to_string);
        event.sdp_answer = Some(answer.to_string());
        event
    }

    /// Error event with a stable code and client-safe reason.
    pub fn error(
        connection_id: &str,
        role: Role,
        stream_id: Option<String>,
        code: i32,
        reason: &str,
    ) -> Self {
        let mut event = Self::base(connection_id, role, "error");
        event.camera_id = stream_id;
        event.code = Some(code);
        event.reason = Some(reason.to_string());
        event
    }
}

/// Recording lifecycle notification published on [`MEETING_EVENTS_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingEvent {
    pub name: &'static str,
    pub meeting_id: String,
    pub stream: String,
    pub filename: String,
    pub timestamp: i64,
}

impl RecordingEvent {
    pub fn started(meeting_id: &str, stream: &str, filename: &str) -> Self {
        Self {
            name: "RecordingStarted",
            meeting_id: meeting_id.to_string(),
            stream: stream.to_string(),
            filename: filename.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn stopped(meeting_id: &str, stream: &str, filename: &str) -> Self {
        Self {
            name: "RecordingStopped",
            meeting_id: meeting_id.to_string(),
            stream: stream.to_string(),
            filename: filename.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
