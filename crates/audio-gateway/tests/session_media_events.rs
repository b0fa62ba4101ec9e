//! Integration tests for media event handling.
//!
//! Covers the session event pump: playStart on first flow, the jittered
//! flow watchdog, pause semantics, recording lifecycle and the offline
//! report. Watchdog tests run under paused time so the jitter window is
//! observable without real waiting.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use audio_gateway::broker::{BrokerPublisher, InboundMessage, OutboundMessage};
use audio_gateway::media::{
    MediaControl, MediaEvent, MediaHandle, SessionOptions, SourceRegistry,
};
use audio_gateway::messages::{FROM_AUDIO_CHANNEL, MEETING_EVENTS_CHANNEL};
use audio_gateway::router::SessionRouter;
use gateway_test_utils::{McsCall, MockMediaControl, TestMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_millis(100);

/// Base flow timeout used by every test here; jitter stays within 2s of it.
const FLOW_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    mcs: Arc<MockMediaControl>,
    inbound: mpsc::Sender<InboundMessage>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    cancel: CancellationToken,
    router: JoinHandle<()>,
}

impl Harness {
    fn spawn(mcs: Arc<MockMediaControl>) -> Self {
        Self::spawn_with_options(
            mcs,
            SessionOptions {
                recording_enabled: false,
                recording_base_path: "/var/sfu/recordings".to_string(),
                flow_timeout: FLOW_TIMEOUT,
            },
        )
    }

    fn spawn_recording(mcs: Arc<MockMediaControl>, base: &str) -> Self {
        Self::spawn_with_options(
            mcs,
            SessionOptions {
                recording_enabled: true,
                recording_base_path: base.to_string(),
                flow_timeout: FLOW_TIMEOUT,
            },
        )
    }

    fn spawn_with_options(mcs: Arc<MockMediaControl>, options: SessionOptions) -> Self {
        let (event_tx, outbound) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let router = SessionRouter::new(
            Arc::clone(&mcs) as Arc<dyn MediaControl>,
            SourceRegistry::new(),
            BrokerPublisher::new(event_tx),
            options,
            cancel.child_token(),
        );
        let router = tokio::spawn(router.run(inbound_rx));

        Self {
            mcs,
            inbound: inbound_tx,
            outbound,
            cancel,
            router,
        }
    }

    async fn send(&self, message: TestMessage) {
        self.inbound
            .send(message.into_inbound())
            .await
            .expect("router inbound channel closed");
    }

    async fn next_outbound_within(&mut self, wait: Duration) -> (String, Value) {
        let message = tokio::time::timeout(wait, self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound event")
            .expect("outbound channel closed");
        let value = serde_json::from_str(&message.payload).expect("outbound payload is JSON");
        (message.channel, value)
    }

    async fn expect_event(&mut self, id: &str) -> Value {
        let (channel, value) = self.next_outbound_within(EVENT_TIMEOUT).await;
        assert_eq!(channel, FROM_AUDIO_CHANNEL);
        assert_eq!(value["id"], id, "unexpected event: {value}");
        value
    }

    async fn assert_no_events_within(&mut self, wait: Duration) {
        let outcome = tokio::time::timeout(wait, self.outbound.recv()).await;
        assert!(outcome.is_err(), "unexpected event: {outcome:?}");
    }

    async fn wait_for_calls(&self, predicate: impl Fn(&[McsCall]) -> bool) {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            if predicate(&self.mcs.calls()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "calls never matched: {:?}",
                self.mcs.calls()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Start a publisher session for c1/cam1 and push its first flow.
    async fn started_publisher(&mut self) -> MediaHandle {
        self.send(TestMessage::start("c1", "cam1")).await;
        self.expect_event("startResponse").await;

        let media = MediaHandle::new("media-2");
        self.mcs
            .push_event(&media, MediaEvent::FlowChanged { flowing: true });
        self.expect_event("playStart").await;
        media
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(EVENT_TIMEOUT, self.router).await;
    }
}

// ============================================================================
// Flow events and the watchdog
// ============================================================================

#[tokio::test]
async fn test_first_flow_emits_play_start_once() {
    let mut h = Harness::spawn(MockMediaControl::new());

    let media = h.started_publisher().await;

    // Repeated flow notifications do not repeat the event.
    h.mcs
        .push_event(&media, MediaEvent::FlowChanged { flowing: true });
    h.assert_no_events_within(SETTLE).await;

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_fires_play_stop_within_jitter_window() {
    let mut h = Harness::spawn(MockMediaControl::new());
    let media = h.started_publisher().await;

    let armed_at = tokio::time::Instant::now();
    h.mcs
        .push_event(&media, MediaEvent::FlowChanged { flowing: false });

    let (channel, event) = h.next_outbound_within(Duration::from_secs(60)).await;
    assert_eq!(channel, FROM_AUDIO_CHANNEL);
    assert_eq!(event["id"], "playStop");
    assert_eq!(event["connectionId"], "c1");
    assert_eq!(event["cameraId"], "cam1");

    // 20s base with up to 2s of jitter either way.
    let waited = armed_at.elapsed();
    assert!(
        waited >= Duration::from_secs(18) && waited <= Duration::from_secs(22),
        "watchdog fired outside the jitter window: {waited:?}"
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_flow_recovery_cancels_watchdog() {
    let mut h = Harness::spawn(MockMediaControl::new());
    let media = h.started_publisher().await;

    h.mcs
        .push_event(&media, MediaEvent::FlowChanged { flowing: false });
    h.mcs
        .push_event(&media, MediaEvent::FlowChanged { flowing: true });

    // Well past any possible deadline: the recovered flow disarmed it.
    h.assert_no_events_within(Duration::from_secs(60)).await;

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_viewer_flow_timeout_stays_silent() {
    let mut h = Harness::spawn(MockMediaControl::new());

    h.send(TestMessage::start("c1", "cam1")).await;
    h.expect_event("startResponse").await;
    h.send(TestMessage::start("c2", "cam1").role("viewer")).await;
    h.expect_event("startResponse").await;

    let viewer_media = MediaHandle::new("media-4");
    h.mcs
        .push_event(&viewer_media, MediaEvent::FlowChanged { flowing: true });
    let started = h.expect_event("playStart").await;
    assert_eq!(started["connectionId"], "c2");

    // A viewer losing flow never tells the publisher's audience to stop.
    h.mcs
        .push_event(&viewer_media, MediaEvent::FlowChanged { flowing: false });
    h.assert_no_events_within(Duration::from_secs(60)).await;

    h.shutdown().await;
}

// ============================================================================
// Pause
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_pause_unlinks_and_mutes_flow_interruptions() {
    let mut h = Harness::spawn(MockMediaControl::new());

    h.send(TestMessage::start("c1", "cam1")).await;
    h.expect_event("startResponse").await;
    h.send(TestMessage::start("c2", "cam1").role("viewer")).await;
    h.expect_event("startResponse").await;

    let viewer_media = MediaHandle::new("media-4");
    h.mcs
        .push_event(&viewer_media, MediaEvent::FlowChanged { flowing: true });
    h.expect_event("playStart").await;

    h.send(TestMessage::pause("c2", "cam1", true).role("viewer")).await;
    h.wait_for_calls(|calls| {
        calls.contains(&McsCall::Disconnect {
            source: "media-2".to_string(),
            sink: "media-4".to_string(),
        })
    })
    .await;

    // While paused, a flow interruption must not arm the watchdog.
    h.mcs
        .push_event(&viewer_media, MediaEvent::FlowChanged { flowing: false });
    h.assert_no_events_within(Duration::from_secs(60)).await;

    h.send(TestMessage::pause("c2", "cam1", false).role("viewer")).await;
    h.wait_for_calls(|calls| {
        calls.contains(&McsCall::Connect {
            source: "media-2".to_string(),
            sink: "media-4".to_string(),
        })
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_pause_before_media_flows_is_ignored() {
    let mut h = Harness::spawn(MockMediaControl::new());

    h.send(TestMessage::start("c1", "cam1")).await;
    h.expect_event("startResponse").await;

    // Still STARTING: there is no link to toggle yet.
    h.send(TestMessage::pause("c1", "cam1", true)).await;
    tokio::time::sleep(SETTLE).await;
    assert!(!h
        .mcs
        .calls()
        .iter()
        .any(|c| matches!(c, McsCall::Disconnect { .. })));

    h.shutdown().await;
}

// ============================================================================
// Recording
// ============================================================================

#[tokio::test]
async fn test_recording_lifecycle_for_publisher() {
    let mut h = Harness::spawn_recording(MockMediaControl::new(), "/rec");

    h.started_publisher().await;

    h.wait_for_calls(|calls| {
        calls.contains(&McsCall::StartRecording {
            user: "user-1".to_string(),
            source: "media-2".to_string(),
            path: "/rec/meeting-1/c1cam1-share.mkv".to_string(),
        })
    })
    .await;

    let (channel, started) = h.next_outbound_within(EVENT_TIMEOUT).await;
    assert_eq!(channel, MEETING_EVENTS_CHANNEL);
    assert_eq!(started["name"], "RecordingStarted");
    assert_eq!(started["meetingId"], "meeting-1");
    assert_eq!(started["stream"], "c1cam1-share");
    assert_eq!(started["filename"], "/rec/meeting-1/c1cam1-share.mkv");
    assert!(started["timestamp"].as_i64().unwrap() > 0);

    h.send(TestMessage::stop("c1", "cam1")).await;

    let (channel, stopped) = h.next_outbound_within(EVENT_TIMEOUT).await;
    assert_eq!(channel, MEETING_EVENTS_CHANNEL);
    assert_eq!(stopped["name"], "RecordingStopped");
    assert_eq!(stopped["filename"], "/rec/meeting-1/c1cam1-share.mkv");

    h.wait_for_calls(|calls| calls.iter().any(|c| matches!(c, McsCall::Leave { .. })))
        .await;
    assert!(h.mcs.calls().contains(&McsCall::StopRecording {
        user: "user-1".to_string(),
        recording: "recording-3".to_string(),
    }));

    h.shutdown().await;
}

#[tokio::test]
async fn test_viewer_sessions_do_not_record() {
    let mut h = Harness::spawn_recording(MockMediaControl::new(), "/rec");

    h.send(TestMessage::start("c1", "cam1")).await;
    h.expect_event("startResponse").await;
    h.send(TestMessage::start("c2", "cam1").role("viewer")).await;
    h.expect_event("startResponse").await;

    h.mcs.push_event(
        &MediaHandle::new("media-4"),
        MediaEvent::FlowChanged { flowing: true },
    );
    h.expect_event("playStart").await;

    tokio::time::sleep(SETTLE).await;
    assert!(!h
        .mcs
        .calls()
        .iter()
        .any(|c| matches!(c, McsCall::StartRecording { .. })));

    h.shutdown().await;
}

// ============================================================================
// Server-side candidates and offline
// ============================================================================

#[tokio::test]
async fn test_gathered_candidates_are_relayed_to_the_client() {
    let mut h = Harness::spawn(MockMediaControl::new());

    h.send(TestMessage::start("c1", "cam1")).await;
    h.expect_event("startResponse").await;

    h.mcs.push_event(
        &MediaHandle::new("media-2"),
        MediaEvent::CandidateGathered(serde_json::json!({"candidate": "srv-0"})),
    );

    let event = h.expect_event("iceCandidate").await;
    assert_eq!(event["connectionId"], "c1");
    assert_eq!(event["cameraId"], "cam1");
    assert_eq!(event["candidate"]["candidate"], "srv-0");

    h.shutdown().await;
}

#[tokio::test]
async fn test_server_offline_is_reported_once() {
    let mut h = Harness::spawn(MockMediaControl::new());

    h.send(TestMessage::start("c1", "cam1")).await;
    h.expect_event("startResponse").await;

    h.mcs.set_offline();

    let error = h.expect_event("error").await;
    assert_eq!(error["code"], 2000);
    assert_eq!(error["reason"], "MEDIA_SERVER_OFFLINE");
    assert_eq!(error["cameraId"], "cam1");
    h.assert_no_events_within(SETTLE).await;

    // Teardown still runs; the failed leave is logged, not surfaced.
    h.send(TestMessage::stop("c1", "cam1")).await;
    h.wait_for_calls(|calls| calls.iter().any(|c| matches!(c, McsCall::Leave { .. })))
        .await;
    h.assert_no_events_within(SETTLE).await;

    h.shutdown().await;
}
