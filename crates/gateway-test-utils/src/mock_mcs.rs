//! Mock media control service for audio gateway testing.
//!
//! Records every call so tests can assert on negotiation sequences, and
//! lets tests inject failures, park joins behind a gate, push media events
//! and simulate the server going offline.
//!
//! # Example
//!
//! ```rust,ignore
//! use gateway_test_utils::{McsCall, MockMediaControl};
//!
//! let mcs = MockMediaControl::new();
//! // hand `mcs.clone()` to the router as Arc<dyn MediaControl>...
//!
//! assert_eq!(mcs.join_count(), 1);
//! assert!(matches!(mcs.calls()[0], McsCall::Join { .. }));
//! ```

use async_trait::async_trait;
use audio_gateway::media::{
    MediaControl, MediaControlError, MediaEvent, MediaHandle, MediaKind, Negotiated, UserHandle,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Semaphore};

/// One recorded call against the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum McsCall {
    Join {
        room: String,
    },
    Publish {
        user: String,
        room: String,
        kind: MediaKind,
        descriptor: String,
    },
    Subscribe {
        user: String,
        source: String,
        kind: MediaKind,
        descriptor: String,
    },
    AddIceCandidate {
        media: String,
        candidate: serde_json::Value,
    },
    Connect {
        source: String,
        sink: String,
    },
    Disconnect {
        source: String,
        sink: String,
    },
    StartRecording {
        user: String,
        source: String,
        path: String,
    },
    StopRecording {
        user: String,
        recording: String,
    },
    Leave {
        room: String,
        user: String,
    },
}

#[derive(Default)]
struct Inner {
    calls: Vec<McsCall>,
    next_handle: u64,
    fail_join: Option<MediaControlError>,
    fail_publish: Option<MediaControlError>,
    fail_subscribe: Option<MediaControlError>,
    offline: bool,
    event_senders: HashMap<String, Vec<mpsc::UnboundedSender<MediaEvent>>>,
}

/// In-process [`MediaControl`] implementation for tests.
///
/// Handles are deterministic: users are `user-1`, `user-2`, ..., media
/// elements `media-N` and recordings `recording-N`, all drawn from one
/// counter in call order. Negotiation answers echo the descriptor as
/// `{descriptor}-answer`.
pub struct MockMediaControl {
    inner: Mutex<Inner>,
    join_gate: Semaphore,
}

impl MockMediaControl {
    /// Mock whose joins complete immediately.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_join_permits(Semaphore::MAX_PERMITS)
    }

    /// Mock whose joins park until [`Self::release_join`] is called, one
    /// permit per join. Used to hold a session mid-negotiation.
    #[must_use]
    pub fn with_gated_joins() -> Arc<Self> {
        Self::with_join_permits(0)
    }

    fn with_join_permits(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            join_gate: Semaphore::new(permits),
        })
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let one parked join proceed.
    pub fn release_join(&self) {
        self.join_gate.add_permits(1);
    }

    /// Fail every subsequent join with the given error.
    pub fn set_fail_join(&self, err: Option<MediaControlError>) {
        self.locked().fail_join = err;
    }

    /// Fail every subsequent publish with the given error.
    pub fn set_fail_publish(&self, err: Option<MediaControlError>) {
        self.locked().fail_publish = err;
    }

    /// Fail every subsequent subscribe with the given error.
    pub fn set_fail_subscribe(&self, err: Option<MediaControlError>) {
        self.locked().fail_subscribe = err;
    }

    /// Mark the server offline: every subsequent call fails with
    /// [`MediaControlError::Offline`] and every event subscriber receives
    /// [`MediaEvent::ServerOffline`].
    pub fn set_offline(&self) {
        let senders: Vec<_> = {
            let mut inner = self.locked();
            inner.offline = true;
            inner.event_senders.values().flatten().cloned().collect()
        };
        for tx in senders {
            let _ = tx.send(MediaEvent::ServerOffline);
        }
    }

    /// Deliver a media event to every subscriber of the given element.
    pub fn push_event(&self, media: &MediaHandle, event: MediaEvent) {
        let senders = {
            self.locked()
                .event_senders
                .get(media.as_str())
                .cloned()
                .unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(event.clone());
        }
    }

    /// Snapshot of every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<McsCall> {
        self.locked().calls.clone()
    }

    /// Number of join attempts (including parked and failed ones).
    #[must_use]
    pub fn join_count(&self) -> usize {
        self.count(|call| matches!(call, McsCall::Join { .. }))
    }

    /// Number of leave calls.
    #[must_use]
    pub fn leave_count(&self) -> usize {
        self.count(|call| matches!(call, McsCall::Leave { .. }))
    }

    /// ICE candidates relayed for the given media element, in order.
    #[must_use]
    pub fn candidates_for(&self, media: &MediaHandle) -> Vec<serde_json::Value> {
        self.locked()
            .calls
            .iter()
            .filter_map(|call| match call {
                McsCall::AddIceCandidate {
                    media: m,
                    candidate,
                } if m == media.as_str() => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, matcher: impl Fn(&McsCall) -> bool) -> usize {
        self.locked().calls.iter().filter(|call| matcher(call)).count()
    }

    fn record(&self, call: McsCall) -> Result<(), MediaControlError> {
        let inner = &mut *self.locked();
        inner.calls.push(call);
        if inner.offline {
            return Err(MediaControlError::Offline);
        }
        Ok(())
    }

    fn next_handle(&self, prefix: &str) -> String {
        let mut inner = self.locked();
        inner.next_handle += 1;
        format!("{prefix}-{}", inner.next_handle)
    }
}

#[async_trait]
impl MediaControl for MockMediaControl {
    async fn join(&self, room: &str) -> Result<UserHandle, MediaControlError> {
        self.record(McsCall::Join {
            room: room.to_string(),
        })?;
        if let Some(err) = self.locked().fail_join.clone() {
            return Err(err);
        }

        let permit = self
            .join_gate
            .acquire()
            .await
            .expect("join gate closed unexpectedly");
        permit.forget();

        Ok(UserHandle::new(self.next_handle("user")))
    }

    async fn publish(
        &self,
        user: &UserHandle,
        room: &str,
        kind: MediaKind,
        descriptor: &str,
    ) -> Result<Negotiated, MediaControlError> {
        self.record(McsCall::Publish {
            user: user.as_str().to_string(),
            room: room.to_string(),
            kind,
            descriptor: descriptor.to_string(),
        })?;
        if let Some(err) = self.locked().fail_publish.clone() {
            return Err(err);
        }

        Ok(Negotiated {
            media: MediaHandle::new(self.next_handle("media")),
            answer: format!("{descriptor}-answer"),
        })
    }

    async fn subscribe(
        &self,
        user: &UserHandle,
        source: &MediaHandle,
        kind: MediaKind,
        descriptor: &str,
    ) -> Result<Negotiated, MediaControlError> {
        self.record(McsCall::Subscribe {
            user: user.as_str().to_string(),
            source: source.as_str().to_string(),
            kind,
            descriptor: descriptor.to_string(),
        })?;
        if let Some(err) = self.locked().fail_subscribe.clone() {
            return Err(err);
        }

        Ok(Negotiated {
            media: MediaHandle::new(self.next_handle("media")),
            answer: format!("{descriptor}-answer"),
        })
    }

    async fn add_ice_candidate(
        &self,
        media: &MediaHandle,
        candidate: &serde_json::Value,
    ) -> Result<(), MediaControlError> {
        self.record(McsCall::AddIceCandidate {
            media: media.as_str().to_string(),
            candidate: candidate.clone(),
        })
    }

    async fn connect(
        &self,
        source: &MediaHandle,
        sink: &MediaHandle,
    ) -> Result<(), MediaControlError> {
        self.record(McsCall::Connect {
            source: source.as_str().to_string(),
            sink: sink.as_str().to_string(),
        })
    }

    async fn disconnect(
        &self,
        source: &MediaHandle,
        sink: &MediaHandle,
    ) -> Result<(), MediaControlError> {
        self.record(McsCall::Disconnect {
            source: source.as_str().to_string(),
            sink: sink.as_str().to_string(),
        })
    }

    async fn start_recording(
        &self,
        user: &UserHandle,
        source: &MediaHandle,
        path: &str,
    ) -> Result<MediaHandle, MediaControlError> {
        self.record(McsCall::StartRecording {
            user: user.as_str().to_string(),
            source: source.as_str().to_string(),
            path: path.to_string(),
        })?;
        Ok(MediaHandle::new(self.next_handle("recording")))
    }

    async fn stop_recording(
        &self,
        user: &UserHandle,
        recording: &MediaHandle,
    ) -> Result<(), MediaControlError> {
        self.record(McsCall::StopRecording {
            user: user.as_str().to_string(),
            recording: recording.as_str().to_string(),
        })
    }

    async fn leave(&self, room: &str, user: &UserHandle) -> Result<(), MediaControlError> {
        self.record(McsCall::Leave {
            room: room.to_string(),
            user: user.as_str().to_string(),
        })
    }

    async fn events(
        &self,
        media: &MediaHandle,
    ) -> Result<mpsc::UnboundedReceiver<MediaEvent>, MediaControlError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.locked();
        if inner.offline {
            let _ = tx.send(MediaEvent::ServerOffline);
        }
        inner
            .event_senders
            .entry(media.as_str().to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_calls_in_order() {
        let mcs = MockMediaControl::new();

        let user = mcs.join("vb-1").await.unwrap();
        let negotiated = mcs
            .publish(&user, "vb-1", MediaKind::WebRtc, "O1")
            .await
            .unwrap();

        assert_eq!(negotiated.answer, "O1-answer");
        assert_eq!(mcs.join_count(), 1);
        assert_eq!(
            mcs.calls()[1],
            McsCall::Publish {
                user: "user-1".to_string(),
                room: "vb-1".to_string(),
                kind: MediaKind::WebRtc,
                descriptor: "O1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_gated_join_parks_until_release() {
        let mcs = MockMediaControl::with_gated_joins();

        let waiting = {
            let mcs = Arc::clone(&mcs);
            tokio::spawn(async move { mcs.join("vb-1").await })
        };

        // The attempt is recorded even while parked.
        tokio::task::yield_now().await;
        assert_eq!(mcs.join_count(), 1);
        assert!(!waiting.is_finished());

        mcs.release_join();
        let user = waiting.await.unwrap().unwrap();
        assert_eq!(user.as_str(), "user-1");
    }

    #[tokio::test]
    async fn test_offline_fails_calls_and_notifies_subscribers() {
        let mcs = MockMediaControl::new();
        let media = MediaHandle::new("media-77");
        let mut events = mcs.events(&media).await.unwrap();

        mcs.set_offline();

        assert_eq!(events.recv().await, Some(MediaEvent::ServerOffline));
        assert!(matches!(
            mcs.join("vb-1").await,
            Err(MediaControlError::Offline)
        ));
    }

    #[tokio::test]
    async fn test_push_event_reaches_all_subscribers() {
        let mcs = MockMediaControl::new();
        let media = MediaHandle::new("media-1");
        let mut a = mcs.events(&media).await.unwrap();
        let mut b = mcs.events(&media).await.unwrap();

        mcs.push_event(&media, MediaEvent::FlowChanged { flowing: true });

        assert_eq!(a.recv().await, Some(MediaEvent::FlowChanged { flowing: true }));
        assert_eq!(b.recv().await, Some(MediaEvent::FlowChanged { flowing: true }));
    }
}
