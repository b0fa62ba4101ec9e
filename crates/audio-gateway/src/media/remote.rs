//! WebSocket client for the media control server.
//!
//! The control protocol is JSON over a single WebSocket: requests carry a
//! transaction id and are matched to responses by that id; unsolicited
//! frames carry an `event` name plus the media element they concern and are
//! fanned out to per-element subscribers.
//!
//! The connection is established eagerly at startup. When it drops, every
//! pending request fails with [`MediaControlError::Offline`] and every event
//! subscriber receives [`MediaEvent::ServerOffline`]; the client does not
//! reconnect, because sessions negotiated on the old connection are
//! unrecoverable anyway.

use crate::media::control::{
    MediaControl, MediaControlError, MediaEvent, MediaHandle, MediaKind, Negotiated, UserHandle,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

/// Timeout for the initial WebSocket connect.
pub const MCS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single control request.
pub const MCS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct McsRequest {
    id: u64,
    name: &'static str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McsFrame {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<McsErrorBody>,
    event: Option<String>,
    media_id: Option<String>,
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct McsErrorBody {
    code: Option<i64>,
    message: String,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, MediaControlError>>>;
type SubscriberMap = HashMap<String, Vec<mpsc::UnboundedSender<MediaEvent>>>;

/// Production [`MediaControl`] implementation.
pub struct RemoteMediaControl {
    commands: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<PendingMap>>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    next_transaction: AtomicU64,
    offline: Arc<AtomicBool>,
}

impl RemoteMediaControl {
    /// Connect to the media control server.
    pub async fn connect(url: &str) -> Result<Self, MediaControlError> {
        let (ws, _response) = tokio::time::timeout(MCS_CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| MediaControlError::Request(format!("connect to {url} timed out")))?
            .map_err(|e| MediaControlError::Request(format!("connect to {url} failed: {e}")))?;

        info!(target: "sfu.media.remote", url, "connected to media control server");

        let (mut sink, mut stream) = ws.split();
        let (commands, mut command_rx) = mpsc::unbounded_channel::<String>();

        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Arc<Mutex<SubscriberMap>> = Arc::new(Mutex::new(HashMap::new()));
        let offline = Arc::new(AtomicBool::new(false));

        // Writer task: the single owner of the sink half.
        tokio::spawn(async move {
            while let Some(frame) = command_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!(target: "sfu.media.remote", error = %e, "media control send failed");
                    break;
                }
            }
        });

        // Reader task: routes frames until the stream ends, then declares
        // the server offline.
        let reader_pending = Arc::clone(&pending);
        let reader_subscribers = Arc::clone(&subscribers);
        let reader_offline = Arc::clone(&offline);
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        route_frame(&reader_pending, &reader_subscribers, &text);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "sfu.media.remote", error = %e, "media control receive failed");
                        break;
                    }
                }
            }
            mark_offline(&reader_offline, &reader_pending, &reader_subscribers);
        });

        Ok(Self {
            commands,
            pending,
            subscribers,
            next_transaction: AtomicU64::new(1),
            offline,
        })
    }

    fn pending_locked(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers_locked(&self) -> MutexGuard<'_, SubscriberMap> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue one request and wait for its response.
    #[instrument(skip(self, params), fields(transaction_id))]
    async fn call(&self, name: &'static str, params: Value) -> Result<Value, MediaControlError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MediaControlError::Offline);
        }

        let id = self.next_transaction.fetch_add(1, Ordering::SeqCst);
        tracing::Span::current().record("transaction_id", id);

        let frame = serde_json::to_string(&McsRequest { id, name, params })
            .map_err(|e| MediaControlError::Protocol(format!("encoding {name} failed: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending_locked().insert(id, tx);

        if self.commands.send(frame).is_err() {
            self.pending_locked().remove(&id);
            return Err(MediaControlError::Offline);
        }

        match tokio::time::timeout(MCS_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MediaControlError::Offline),
            Err(_) => {
                self.pending_locked().remove(&id);
                Err(MediaControlError::Request(format!("{name} timed out")))
            }
        }
    }
}

/// Flip the offline flag, fail pending requests and notify subscribers.
fn mark_offline(
    offline: &AtomicBool,
    pending: &Mutex<PendingMap>,
    subscribers: &Mutex<SubscriberMap>,
) {
    if offline.swap(true, Ordering::SeqCst) {
        return;
    }
    warn!(target: "sfu.media.remote", "media control server offline");

    let drained: Vec<_> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for (_, responder) in drained {
        let _ = responder.send(Err(MediaControlError::Offline));
    }

    let senders: Vec<_> = subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .flatten()
        .cloned()
        .collect();
    for sender in senders {
        let _ = sender.send(MediaEvent::ServerOffline);
    }
}

fn route_frame(pending: &Mutex<PendingMap>, subscribers: &Mutex<SubscriberMap>, text: &str) {
    let frame: McsFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(target: "sfu.media.remote", error = %e, "discarding undecodable control frame");
            return;
        }
    };

    if let Some(id) = frame.id {
        let responder = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(responder) = responder else {
            debug!(target: "sfu.media.remote", transaction_id = id, "response for unknown transaction");
            return;
        };

        let outcome = match frame.error {
            Some(body) => Err(MediaControlError::Request(match body.code {
                Some(code) => format!("{} (code {code})", body.message),
                None => body.message,
            })),
            None => Ok(frame.result.unwrap_or(Value::Null)),
        };
        let _ = responder.send(outcome);
        return;
    }

    if let (Some(event), Some(media_id)) = (frame.event.as_deref(), frame.media_id.as_deref()) {
        let Some(media_event) = event_from_frame(event, frame.params.as_ref()) else {
            debug!(target: "sfu.media.remote", event, media_id, "ignoring unknown event");
            return;
        };

        let mut guard = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = guard.get_mut(media_id) {
            senders.retain(|sender| sender.send(media_event.clone()).is_ok());
        }
    }
}

fn event_from_frame(name: &str, params: Option<&Value>) -> Option<MediaEvent> {
    match name {
        "mediaFlow" => {
            let flowing = params?.get("flowing")?.as_bool()?;
            Some(MediaEvent::FlowChanged { flowing })
        }
        "iceCandidate" => {
            let candidate = params?.get("candidate")?.clone();
            Some(MediaEvent::CandidateGathered(candidate))
        }
        "recording" => {
            let state = params?.get("state")?.as_str()?.to_string();
            Some(MediaEvent::RecordingChanged { state })
        }
        _ => None,
    }
}

fn require_str(result: &Value, field: &str) -> Result<String, MediaControlError> {
    result
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MediaControlError::Protocol(format!("response missing {field}")))
}

#[async_trait]
impl MediaControl for RemoteMediaControl {
    async fn join(&self, room: &str) -> Result<UserHandle, MediaControlError> {
        let result = self.call("join", json!({ "room": room })).await?;
        Ok(UserHandle::new(require_str(&result, "userId")?))
    }

    async fn publish(
        &self,
        user: &UserHandle,
        room: &str,
        kind: MediaKind,
        descriptor: &str,
    ) -> Result<Negotiated, MediaControlError> {
        let result = self
            .call(
                "publish",
                json!({
                    "userId": user.as_str(),
                    "room": room,
                    "kind": kind.as_str(),
                    "descriptor": descriptor,
                }),
            )
            .await?;

        Ok(Negotiated {
            media: MediaHandle::new(require_str(&result, "mediaId")?),
            answer: require_str(&result, "answer")?,
        })
    }

    async fn subscribe(
        &self,
        user: &UserHandle,
        source: &MediaHandle,
        kind: MediaKind,
        descriptor: &str,
    ) -> Result<Negotiated, MediaControlError> {
        let result = self
            .call(
                "subscribe",
                json!({
                    "userId": user.as_str(),
                    "sourceId": source.as_str(),
                    "kind": kind.as_str(),
                    "descriptor": descriptor,
                }),
            )
            .await?;

        Ok(Negotiated {
            media: MediaHandle::new(require_str(&result, "mediaId")?),
            answer: require_str(&result, "answer")?,
        })
    }

    async fn add_ice_candidate(
        &self,
        media: &MediaHandle,
        candidate: &Value,
    ) -> Result<(), MediaControlError> {
        self.call(
            "addIceCandidate",
            json!({ "mediaId": media.as_str(), "candidate": candidate }),
        )
        .await?;
        Ok(())
    }

    async fn connect(
        &self,
        source: &MediaHandle,
        sink: &MediaHandle,
    ) -> Result<(), MediaControlError> {
        self.call(
            "connect",
            json!({ "sourceId": source.as_str(), "sinkId": sink.as_str() }),
        )
        .await?;
        Ok(())
    }

    async fn disconnect(
        &self,
        source: &MediaHandle,
        sink: &MediaHandle,
    ) -> Result<(), MediaControlError> {
        self.call(
            "disconnect",
            json!({ "sourceId": source.as_str(), "sinkId": sink.as_str() }),
        )
        .await?;
        Ok(())
    }

    async fn start_recording(
        &self,
        user: &UserHandle,
        source: &MediaHandle,
        path: &str,
    ) -> Result<MediaHandle, MediaControlError> {
        let result = self
            .call(
                "startRecording",
                json!({
                    "userId": user.as_str(),
                    "sourceId": source.as_str(),
                    "path": path,
                }),
            )
            .await?;

        Ok(MediaHandle::new(require_str(&result, "mediaId")?))
    }

    async fn stop_recording(
        &self,
        user: &UserHandle,
        recording: &MediaHandle,
    ) -> Result<(), MediaControlError> {
        self.call(
            "stopRecording",
            json!({ "userId": user.as_str(), "recordingId": recording.as_str() }),
        )
        .await?;
        Ok(())
    }

    async fn leave(&self, room: &str, user: &UserHandle) -> Result<(), MediaControlError> {
        self.call("leave", json!({ "room": room, "userId": user.as_str() }))
            .await?;
        Ok(())
    }

    async fn events(
        &self,
        media: &MediaHandle,
    ) -> Result<mpsc::UnboundedReceiver<MediaEvent>, MediaControlError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.offline.load(Ordering::SeqCst) {
            // Let the subscriber observe the outage instead of racing it.
            let _ = tx.send(MediaEvent::ServerOffline);
        }
        self.subscribers_locked()
            .entry(media.as_str().to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_constants() {
        assert_eq!(MCS_CONNECT_TIMEOUT, Duration::from_secs(5));
        assert_eq!(MCS_REQUEST_TIMEOUT, Duration::from_secs(10));
    }

    #[test]
    fn test_request_serialization() {
        let frame = McsRequest {
            id: 7,
            name: "join",
            params: json!({ "room": "70001" }),
        };
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["id"], 7);
        assert_eq!(value["name"], "join");
        assert_eq!(value["params"]["room"], "70001");
    }

    #[test]
    fn test_result_frame_decodes() {
        let frame: McsFrame =
            serde_json::from_str(r#"{"id":3,"result":{"userId":"user-1"}}"#).unwrap();

        assert_eq!(frame.id, Some(3));
        assert_eq!(frame.result.unwrap()["userId"], "user-1");
        assert!(frame.error.is_none());
    }

    #[test]
    fn test_error_frame_decodes() {
        let frame: McsFrame =
            serde_json::from_str(r#"{"id":4,"error":{"code":40300,"message":"no such room"}}"#)
                .unwrap();

        let error = frame.error.unwrap();
        assert_eq!(error.code, Some(40300));
        assert_eq!(error.message, "no such room");
    }

    #[test]
    fn test_event_frame_mapping() {
        assert_eq!(
            event_from_frame("mediaFlow", Some(&json!({ "flowing": true }))),
            Some(MediaEvent::FlowChanged { flowing: true })
        );
        assert_eq!(
            event_from_frame("iceCandidate", Some(&json!({ "candidate": { "sdpMid": "0" } }))),
            Some(MediaEvent::CandidateGathered(json!({ "sdpMid": "0" })))
        );
        assert_eq!(
            event_from_frame("recording", Some(&json!({ "state": "STARTED" }))),
            Some(MediaEvent::RecordingChanged {
                state: "STARTED".to_string()
            })
        );
        assert_eq!(event_from_frame("mystery", Some(&json!({}))), None);
        assert_eq!(event_from_frame("mediaFlow", None), None);
    }

    #[test]
    fn test_missing_field_is_a_protocol_error() {
        let result = json!({ "answer": "v=0..." });
        let err = require_str(&result, "mediaId").unwrap_err();
        assert!(matches!(err, MediaControlError::Protocol(_)));
    }
}
