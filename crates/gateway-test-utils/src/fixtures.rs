//! Pre-built control messages for router and session tests.
//!
//! Builds the JSON payloads a client-facing gateway would publish on the
//! inbound audio channel, ready to feed into the router as
//! [`InboundMessage`]s.

use audio_gateway::broker::InboundMessage;
use serde_json::{json, Value};

/// Channel name stamped on fixture messages.
pub const TEST_CHANNEL: &str = "to-sfu-audio";

/// Builder for inbound control message payloads.
///
/// # Example
///
/// ```rust,ignore
/// use gateway_test_utils::TestMessage;
///
/// let start = TestMessage::start("c1", "cam1").role("viewer").into_inbound();
/// let stop = TestMessage::stop("c1", "cam1").into_inbound();
/// ```
#[derive(Debug, Clone)]
pub struct TestMessage {
    id: &'static str,
    connection_id: String,
    camera_id: Option<String>,
    role: Option<String>,
    sdp_offer: Option<String>,
    candidate: Option<Value>,
    state: Option<bool>,
    meeting_id: Option<String>,
    voice_bridge: Option<String>,
}

impl TestMessage {
    fn new(id: &'static str, connection_id: &str) -> Self {
        Self {
            id,
            connection_id: connection_id.to_string(),
            camera_id: None,
            role: None,
            sdp_offer: None,
            candidate: None,
            state: None,
            meeting_id: None,
            voice_bridge: None,
        }
    }

    /// Start message with a default offer, meeting and voice bridge.
    #[must_use]
    pub fn start(connection_id: &str, camera_id: &str) -> Self {
        let mut msg = Self::new("start", connection_id);
        msg.camera_id = Some(camera_id.to_string());
        msg.sdp_offer = Some(format!("offer-{camera_id}"));
        msg.meeting_id = Some("meeting-1".to_string());
        msg.voice_bridge = Some("vb-1".to_string());
        msg
    }

    /// External feed publish message with an RTP descriptor.
    #[must_use]
    pub fn publish(connection_id: &str, camera_id: &str) -> Self {
        let mut msg = Self::new("publish", connection_id);
        msg.camera_id = Some(camera_id.to_string());
        msg.sdp_offer = Some(format!("rtp-{camera_id}"));
        msg.meeting_id = Some("meeting-1".to_string());
        msg
    }

    #[must_use]
    pub fn stop(connection_id: &str, camera_id: &str) -> Self {
        let mut msg = Self::new("stop", connection_id);
        msg.camera_id = Some(camera_id.to_string());
        msg
    }

    #[must_use]
    pub fn pause(connection_id: &str, camera_id: &str, state: bool) -> Self {
        let mut msg = Self::new("pause", connection_id);
        msg.camera_id = Some(camera_id.to_string());
        msg.state = Some(state);
        msg
    }

    /// ICE candidate message carrying an opaque candidate object.
    #[must_use]
    pub fn candidate(connection_id: &str, camera_id: &str, candidate: Value) -> Self {
        let mut msg = Self::new("onIceCandidate", connection_id);
        msg.camera_id = Some(camera_id.to_string());
        msg.candidate = Some(candidate);
        msg
    }

    #[must_use]
    pub fn close(connection_id: &str) -> Self {
        Self::new("close", connection_id)
    }

    /// Message with an operation name the router does not know.
    #[must_use]
    pub fn unknown(connection_id: &str) -> Self {
        Self::new("subscribeToGlobalAnnouncements", connection_id)
    }

    #[must_use]
    pub fn role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    #[must_use]
    pub fn offer(mut self, offer: &str) -> Self {
        self.sdp_offer = Some(offer.to_string());
        self
    }

    #[must_use]
    pub fn meeting(mut self, meeting_id: &str) -> Self {
        self.meeting_id = Some(meeting_id.to_string());
        self
    }

    #[must_use]
    pub fn voice_bridge(mut self, voice_bridge: &str) -> Self {
        self.voice_bridge = Some(voice_bridge.to_string());
        self
    }

    /// Drop the stream identifier to simulate a malformed message.
    #[must_use]
    pub fn without_camera(mut self) -> Self {
        self.camera_id = None;
        self
    }

    /// Wire payload for this message.
    #[must_use]
    pub fn build(self) -> Value {
        let mut payload = json!({
            "id": self.id,
            "connectionId": self.connection_id,
        });
        let fields = [
            ("cameraId", self.camera_id.map(Value::from)),
            ("role", self.role.map(Value::from)),
            ("sdpOffer", self.sdp_offer.map(Value::from)),
            ("candidate", self.candidate),
            ("state", self.state.map(Value::from)),
            ("meetingId", self.meeting_id.map(Value::from)),
            ("voiceBridge", self.voice_bridge.map(Value::from)),
        ];
        if let Some(object) = payload.as_object_mut() {
            for (name, value) in fields {
                if let Some(value) = value {
                    object.insert(name.to_string(), value);
                }
            }
        }
        payload
    }

    /// The message as the router receives it from the broker.
    #[must_use]
    pub fn into_inbound(self) -> InboundMessage {
        InboundMessage {
            channel: TEST_CHANNEL.to_string(),
            payload: self.build(),
        }
    }
}
