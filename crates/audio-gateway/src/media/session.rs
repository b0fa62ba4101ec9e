//! Per-session signaling state machine.
//!
//! A [`MediaSession`] owns one negotiated audio leg: publisher or viewer.
//! Its lifecycle is `STOPPED -> STARTING -> STARTED <-> PAUSED`, with
//! `STOPPING -> STOPPED` reachable from any active state. Transitions live
//! in a watch cell so readers never block and stop callers can collapse
//! onto an in-flight teardown.
//!
//! Supporting tasks are spawned per session and die with its cancellation
//! token: an ICE forwarder that drains the ordered candidate queue into the
//! media server, and an event pump that turns media server notifications
//! into client events, drives the flow watchdog and starts recording.

use crate::broker::BrokerPublisher;
use crate::config::Config;
use crate::errors::AudioError;
use crate::media::control::{MediaControl, MediaEvent, MediaHandle, MediaKind, UserHandle};
use crate::media::registry::{SourceRegistry, SourceResolution};
use crate::messages::{ClientEvent, RecordingEvent, SessionKey};
use rand::Rng;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Random jitter applied around the flow watchdog base timeout, so a mass
/// outage does not fire every watchdog in the same instant.
const FLOW_JITTER_MS: i64 = 2_000;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Stopped,
    Starting,
    Started,
    Paused,
    Stopping,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Stopped => "stopped",
            SessionStatus::Starting => "starting",
            SessionStatus::Started => "started",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Per-session knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub recording_enabled: bool,
    pub recording_base_path: String,
    pub flow_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            recording_enabled: config.recording_enabled,
            recording_base_path: config.recording_base_path.clone(),
            flow_timeout: Duration::from_millis(config.media_flow_timeout_ms),
        }
    }
}

#[derive(Debug)]
struct Recording {
    handle: MediaHandle,
    path: String,
}

#[derive(Debug, Default)]
struct SessionInner {
    user: Option<UserHandle>,
    media: Option<MediaHandle>,
    recording: Option<Recording>,
    ice_tx: Option<mpsc::UnboundedSender<serde_json::Value>>,
    ice_rx: Option<mpsc::UnboundedReceiver<serde_json::Value>>,
    negotiating: bool,
    offline_reported: bool,
}

/// One audio signaling session.
pub struct MediaSession {
    key: SessionKey,
    meeting_id: String,
    voice_bridge: String,
    shared: bool,
    options: SessionOptions,
    mcs: Arc<dyn MediaControl>,
    registry: SourceRegistry,
    events: BrokerPublisher,
    status: watch::Sender<SessionStatus>,
    join_settled: watch::Sender<bool>,
    inner: Mutex<SessionInner>,
    cancel: CancellationToken,
}

impl MediaSession {
    pub fn new(
        key: SessionKey,
        meeting_id: String,
        voice_bridge: String,
        options: SessionOptions,
        mcs: Arc<dyn MediaControl>,
        registry: SourceRegistry,
        events: BrokerPublisher,
    ) -> Self {
        let (ice_tx, ice_rx) = mpsc::unbounded_channel();
        let shared = key.role.is_shared();

        Self {
            key,
            meeting_id,
            voice_bridge,
            shared,
            options,
            mcs,
            registry,
            events,
            status: watch::Sender::new(SessionStatus::Stopped),
            join_settled: watch::Sender::new(false),
            inner: Mutex::new(SessionInner {
                ice_tx: Some(ice_tx),
                ice_rx: Some(ice_rx),
                ..SessionInner::default()
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    fn locked(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the `STOPPED -> STARTING` transition.
    ///
    /// This is synchronous so the creator can mark the session as
    /// negotiating before yielding; duplicate starts arriving in the
    /// meantime are rejected with [`AudioError::AlreadyStarting`].
    pub fn begin_start(&self) -> Result<(), AudioError> {
        if self.cancel.is_cancelled() {
            return Err(AudioError::Internal(format!(
                "session {} already torn down",
                self.key
            )));
        }

        let claimed = self.status.send_if_modified(|status| {
            if *status == SessionStatus::Stopped {
                *status = SessionStatus::Starting;
                true
            } else {
                false
            }
        });

        if claimed {
            Ok(())
        } else {
            Err(AudioError::AlreadyStarting(self.key.stream_name()))
        }
    }

    /// Negotiate the session: join the bridge, publish or subscribe, and
    /// arm the supporting tasks. Requires a prior [`Self::begin_start`].
    ///
    /// On failure the session tears itself down before returning, so the
    /// media server never keeps a user joined for a dead session.
    pub async fn start(self: &Arc<Self>, sdp_offer: &str) -> Result<String, AudioError> {
        {
            let mut inner = self.locked();
            if *self.status.borrow() != SessionStatus::Starting || inner.negotiating {
                return Err(AudioError::AlreadyStarting(self.key.stream_name()));
            }
            inner.negotiating = true;
        }

        info!(
            target: "sfu.media.session",
            stream = %self.key,
            role = %self.key.role,
            voice_bridge = %self.voice_bridge,
            "starting audio session"
        );

        let user = match self.mcs.join(&self.voice_bridge).await {
            Ok(user) => user,
            Err(e) => {
                self.join_settled.send_replace(true);
                let err = AudioError::media(self.key.role, self.key.stream_name(), e);
                self.stop().await;
                return Err(err);
            }
        };
        {
            self.locked().user = Some(user.clone());
        }
        self.join_settled.send_replace(true);

        if *self.status.borrow() != SessionStatus::Starting {
            // A stop raced in while we were joining; it waited for the join
            // to settle and will leave the bridge.
            self.stop().await;
            return Err(AudioError::Internal(format!(
                "session {} stopped during negotiation",
                self.key
            )));
        }

        let negotiated = if self.shared {
            match self
                .mcs
                .publish(&user, &self.voice_bridge, MediaKind::WebRtc, sdp_offer)
                .await
            {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    let err = AudioError::media(self.key.role, self.key.stream_name(), e);
                    self.stop().await;
                    return Err(err);
                }
            }
        } else {
            let source = match self.registry.resolve(&self.key.stream_id) {
                SourceResolution::Ready(source) => source,
                SourceResolution::Pending(waiter) => {
                    debug!(
                        target: "sfu.media.session",
                        stream = %self.key,
                        "no audio source yet, waiting for its publisher"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            self.stop().await;
                            return Err(AudioError::Internal(format!(
                                "session {} stopped while waiting for its audio source",
                                self.key
                            )));
                        }
                        resolved = waiter => match resolved {
                            Ok(source) => source,
                            Err(_) => {
                                self.stop().await;
                                return Err(AudioError::Internal(
                                    "audio source waiter dropped".to_string(),
                                ));
                            }
                        }
                    }
                }
            };

            match self
                .mcs
                .subscribe(&user, &source, MediaKind::WebRtc, sdp_offer)
                .await
            {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    let err = AudioError::media(self.key.role, self.key.stream_name(), e);
                    self.stop().await;
                    return Err(err);
                }
            }
        };

        let media = negotiated.media.clone();

        // Commit point: media assignment and source registration are only
        // valid while the session is still STARTING. A stop that raced past
        // the check above cleans up whatever it saw; anything negotiated
        // after its snapshot must not be committed.
        {
            let mut inner = self.locked();
            if *self.status.borrow() != SessionStatus::Starting {
                drop(inner);
                self.stop().await;
                return Err(AudioError::Internal(format!(
                    "session {} stopped during negotiation",
                    self.key
                )));
            }
            inner.media = Some(media.clone());
            if self.shared {
                self.registry.register(&self.key.stream_id, media.clone());
            }
        }

        self.spawn_ice_forwarder(media.clone());
        if let Err(e) = self.spawn_event_pump(media.clone()).await {
            self.stop().await;
            return Err(e);
        }

        info!(
            target: "sfu.media.session",
            stream = %self.key,
            media = %media,
            "audio session negotiated"
        );
        Ok(negotiated.answer)
    }

    /// Tear the session down.
    ///
    /// Teardown is single-flight: the first caller performs it and every
    /// concurrent caller waits for the same completion. Never leaves the
    /// bridge before an in-flight join has settled, and never fails; media
    /// server errors during teardown are logged and skipped.
    pub async fn stop(&self) {
        let mut status_rx = self.status.subscribe();
        let claimed = self.status.send_if_modified(|status| match status {
            SessionStatus::Stopped | SessionStatus::Stopping => false,
            _ => {
                *status = SessionStatus::Stopping;
                true
            }
        });

        if !claimed {
            let _ = status_rx
                .wait_for(|status| *status == SessionStatus::Stopped)
                .await;
            return;
        }

        debug!(target: "sfu.media.session", stream = %self.key, "stopping audio session");
        self.cancel.cancel();

        // If a negotiation claimed this session, its join settles even on
        // failure; wait so we never leave a bridge we are still joining.
        let negotiating = { self.locked().negotiating };
        if negotiating {
            let mut join_rx = self.join_settled.subscribe();
            let _ = join_rx.wait_for(|settled| *settled).await;
        }

        let recording = { self.locked().recording.take() };
        if let Some(recording) = recording {
            let user = { self.locked().user.clone() };
            if let Some(user) = user {
                if let Err(e) = self.mcs.stop_recording(&user, &recording.handle).await {
                    warn!(
                        target: "sfu.media.session",
                        stream = %self.key,
                        error = %e,
                        "failed to stop recording during teardown"
                    );
                }
            }
            self.events.publish_meeting_event(&RecordingEvent::stopped(
                &self.meeting_id,
                &self.key.stream_name(),
                &recording.path,
            ));
        }

        let user = { self.locked().user.clone() };
        if let Some(user) = user {
            if let Err(e) = self.mcs.leave(&self.voice_bridge, &user).await {
                warn!(
                    target: "sfu.media.session",
                    stream = %self.key,
                    error = %e,
                    "leave failed during teardown"
                );
            }
        }

        {
            let mut inner = self.locked();
            inner.user = None;
            inner.media = None;
            inner.ice_tx = None;
            inner.ice_rx = None;
        }

        if self.shared && self.registry.remove(&self.key.stream_id).is_some() {
            debug!(
                target: "sfu.media.session",
                stream = %self.key,
                "audio source unregistered"
            );
        }

        self.status.send_replace(SessionStatus::Stopped);
        info!(target: "sfu.media.session", stream = %self.key, "audio session stopped");
    }

    /// Toggle the media link between the stream source and this session.
    ///
    /// Only meaningful between `STARTED` and `PAUSED`; anything else is
    /// ignored. The state flips only after the media server confirmed the
    /// link change.
    pub async fn pause(&self, paused: bool) {
        match (self.status(), paused) {
            (SessionStatus::Started, true) => {
                let Some((source, sink)) = self.link_endpoints() else {
                    return;
                };
                match self.mcs.disconnect(&source, &sink).await {
                    Ok(()) => {
                        self.status.send_if_modified(|status| {
                            if *status == SessionStatus::Started {
                                *status = SessionStatus::Paused;
                                true
                            } else {
                                false
                            }
                        });
                        info!(target: "sfu.media.session", stream = %self.key, "audio session paused");
                    }
                    Err(e) => warn!(
                        target: "sfu.media.session",
                        stream = %self.key,
                        error = %e,
                        "pause failed"
                    ),
                }
            }
            (SessionStatus::Paused, false) => {
                let Some((source, sink)) = self.link_endpoints() else {
                    return;
                };
                match self.mcs.connect(&source, &sink).await {
                    Ok(()) => {
                        self.status.send_if_modified(|status| {
                            if *status == SessionStatus::Paused {
                                *status = SessionStatus::Started;
                                true
                            } else {
                                false
                            }
                        });
                        info!(target: "sfu.media.session", stream = %self.key, "audio session resumed");
                    }
                    Err(e) => warn!(
                        target: "sfu.media.session",
                        stream = %self.key,
                        error = %e,
                        "resume failed"
                    ),
                }
            }
            (status, _) => {
                debug!(
                    target: "sfu.media.session",
                    stream = %self.key,
                    status = %status,
                    paused,
                    "ignoring pause toggle"
                );
            }
        }
    }

    fn link_endpoints(&self) -> Option<(MediaHandle, MediaHandle)> {
        let source = self.registry.get(&self.key.stream_id);
        let sink = { self.locked().media.clone() };
        match (source, sink) {
            (Some(source), Some(sink)) => Some((source, sink)),
            _ => {
                warn!(
                    target: "sfu.media.session",
                    stream = %self.key,
                    "cannot toggle pause without negotiated media"
                );
                None
            }
        }
    }

    /// Queue a client ICE candidate.
    ///
    /// Candidates are relayed strictly in arrival order: before negotiation
    /// finishes they pile up in the queue, afterwards the forwarder drains
    /// them one at a time.
    pub fn on_ice_candidate(&self, candidate: serde_json::Value) {
        let inner = self.locked();
        match &inner.ice_tx {
            Some(tx) => {
                let _ = tx.send(candidate);
            }
            None => {
                debug!(
                    target: "sfu.media.session",
                    stream = %self.key,
                    "discarding ICE candidate for stopped session"
                );
            }
        }
    }

    fn spawn_ice_forwarder(&self, media: MediaHandle) {
        let Some(mut candidates) = self.locked().ice_rx.take() else {
            return;
        };
        let mcs = Arc::clone(&self.mcs);
        let cancel = self.cancel.clone();
        let key = self.key.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    maybe = candidates.recv() => {
                        let Some(candidate) = maybe else { break };
                        if let Err(e) = mcs.add_ice_candidate(&media, &candidate).await {
                            warn!(
                                target: "sfu.media.session",
                                stream = %key,
                                error = %e,
                                "failed to relay ICE candidate"
                            );
                        }
                    }
                }
            }
        });
    }

    async fn spawn_event_pump(self: &Arc<Self>, media: MediaHandle) -> Result<(), AudioError> {
        let mut events = self
            .mcs
            .events(&media)
            .await
            .map_err(|e| AudioError::media(self.key.role, self.key.stream_name(), e))?;

        let session = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                let watchdog = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = watchdog => {
                        deadline = None;
                        session.on_flow_timeout();
                    }
                    maybe = events.recv() => {
                        let Some(event) = maybe else { break };
                        session.handle_media_event(event, &mut deadline).await;
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_media_event(
        self: &Arc<Self>,
        event: MediaEvent,
        deadline: &mut Option<Instant>,
    ) {
        match event {
            MediaEvent::FlowChanged { flowing: true } => {
                if deadline.take().is_some() {
                    debug!(
                        target: "sfu.media.session",
                        stream = %self.key,
                        "media flow recovered, watchdog cleared"
                    );
                }

                let became_started = self.status.send_if_modified(|status| {
                    if *status == SessionStatus::Starting {
                        *status = SessionStatus::Started;
                        true
                    } else {
                        false
                    }
                });
                if became_started {
                    info!(target: "sfu.media.session", stream = %self.key, "audio session started");
                    self.events.publish_event(&ClientEvent::play_start(
                        &self.key.connection_id,
                        self.key.role,
                        &self.key.stream_id,
                    ));
                    if self.shared && self.options.recording_enabled {
                        self.start_recording().await;
                    }
                }
            }
            MediaEvent::FlowChanged { flowing: false } => {
                if self.status() == SessionStatus::Paused {
                    debug!(
                        target: "sfu.media.session",
                        stream = %self.key,
                        "ignoring flow interruption while paused"
                    );
                    return;
                }
                if deadline.is_none() {
                    let timeout = flow_timeout_with_jitter(self.options.flow_timeout);
                    *deadline = Some(Instant::now() + timeout);
                    warn!(
                        target: "sfu.media.session",
                        stream = %self.key,
                        timeout_ms = timeout.as_millis(),
                        "media flow interrupted, watchdog armed"
                    );
                }
            }
            MediaEvent::CandidateGathered(candidate) => {
                self.events.publish_event(&ClientEvent::ice_candidate(
                    &self.key.connection_id,
                    self.key.role,
                    &self.key.stream_id,
                    candidate,
                ));
            }
            MediaEvent::RecordingChanged { state } => {
                debug!(
                    target: "sfu.media.session",
                    stream = %self.key,
                    state = %state,
                    "recording state changed"
                );
            }
            MediaEvent::ServerOffline => self.report_offline(),
        }
    }

    /// Watchdog expired without a flow recovery.
    fn on_flow_timeout(&self) {
        if self.shared {
            warn!(
                target: "sfu.media.session",
                stream = %self.key,
                "media flow did not recover, notifying stream stopped"
            );
            self.events.publish_event(&ClientEvent::play_stop(
                &self.key.connection_id,
                self.key.role,
                &self.key.stream_id,
            ));
        } else {
            debug!(
                target: "sfu.media.session",
                stream = %self.key,
                "media flow did not recover on viewer session"
            );
        }
    }

    /// The media server connection is gone; this session is dead.
    fn report_offline(&self) {
        {
            let mut inner = self.locked();
            if inner.offline_reported {
                return;
            }
            inner.offline_reported = true;
        }

        let err = AudioError::MediaServerOffline;
        error!(
            target: "sfu.media.session",
            stream = %self.key,
            "media server offline, session is unrecoverable"
        );
        self.events.publish_event(&ClientEvent::error(
            &self.key.connection_id,
            self.key.role,
            Some(self.key.stream_id.clone()),
            err.error_code(),
            err.client_reason(),
        ));
    }

    /// Best-effort recording start, triggered by the first flow.
    async fn start_recording(self: &Arc<Self>) {
        let (user, media) = {
            let inner = self.locked();
            (inner.user.clone(), inner.media.clone())
        };
        let (Some(user), Some(media)) = (user, media) else {
            return;
        };

        let path = recording_path(
            &self.options.recording_base_path,
            &self.meeting_id,
            &self.key.stream_name(),
        );

        match self.mcs.start_recording(&user, &media, &path).await {
            Ok(handle) => {
                {
                    self.locked().recording = Some(Recording {
                        handle: handle.clone(),
                        path: path.clone(),
                    });
                }

                match self.mcs.events(&handle).await {
                    Ok(events) => self.spawn_recording_pump(events),
                    Err(e) => warn!(
                        target: "sfu.media.session",
                        stream = %self.key,
                        error = %e,
                        "recording events unavailable"
                    ),
                }

                self.events.publish_meeting_event(&RecordingEvent::started(
                    &self.meeting_id,
                    &self.key.stream_name(),
                    &path,
                ));
                info!(
                    target: "sfu.media.session",
                    stream = %self.key,
                    path = %path,
                    "recording started"
                );
            }
            Err(e) => warn!(
                target: "sfu.media.session",
                stream = %self.key,
                error = %e,
                "failed to start recording"
            ),
        }
    }

    fn spawn_recording_pump(&self, mut events: mpsc::UnboundedReceiver<MediaEvent>) {
        let cancel = self.cancel.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    maybe = events.recv() => {
                        match maybe {
                            Some(MediaEvent::RecordingChanged { state }) => {
                                debug!(
                                    target: "sfu.media.session",
                                    stream = %key,
                                    state = %state,
                                    "recording state changed"
                                );
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });
    }
}

/// Deterministic recording file path for a stream.
fn recording_path(base: &str, meeting_id: &str, stream_name: &str) -> String {
    format!("{base}/{meeting_id}/{stream_name}.mkv")
}

/// Base watchdog timeout with uniform jitter in `[-2s, +2s]`.
fn flow_timeout_with_jitter(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(-FLOW_JITTER_MS..=FLOW_JITTER_MS);
    let millis = (base.as_millis() as i64).saturating_add(jitter).max(0);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_flow_timeout_jitter_bounds() {
        let base = Duration::from_millis(20_000);
        for _ in 0..200 {
            let jittered = flow_timeout_with_jitter(base);
            assert!(jittered >= Duration::from_millis(18_000));
            assert!(jittered <= Duration::from_millis(22_000));
        }
    }

    #[test]
    fn test_flow_timeout_jitter_clamps_at_zero() {
        // Jitter can exceed a short base; the result must clamp at zero
        // instead of underflowing.
        for _ in 0..200 {
            let jittered = flow_timeout_with_jitter(Duration::from_millis(500));
            assert!(jittered <= Duration::from_millis(2_500));
        }
    }

    #[test]
    fn test_recording_path_is_deterministic() {
        assert_eq!(
            recording_path("/var/sfu/recordings", "meeting-1", "c1cam-1-share"),
            "/var/sfu/recordings/meeting-1/c1cam-1-share.mkv"
        );
    }

    #[test]
    fn test_session_options_from_config() {
        let vars = HashMap::from([
            ("SFU_RECORDING_ENABLED".to_string(), "true".to_string()),
            ("SFU_MEDIA_FLOW_TIMEOUT_MS".to_string(), "7500".to_string()),
        ]);
        let config = Config::from_vars(&vars).unwrap();

        let options = SessionOptions::from_config(&config);
        assert!(options.recording_enabled);
        assert_eq!(options.flow_timeout, Duration::from_millis(7500));
        assert_eq!(
            options.recording_base_path,
            crate::config::DEFAULT_RECORDING_BASE_PATH
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Stopped.to_string(), "stopped");
        assert_eq!(SessionStatus::Starting.to_string(), "starting");
        assert_eq!(SessionStatus::Stopping.to_string(), "stopping");
    }
}
