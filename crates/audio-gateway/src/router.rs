//! Inbound control message routing.
//!
//! The [`SessionRouter`] owns the session table: one task receives decoded
//! broker messages, derives a session key, and dispatches the operation to
//! the right [`MediaSession`]. Dispatch itself never blocks on the media
//! server; anything that negotiates or tears down is spawned, and the
//! session's own state machine serializes overlapping operations.
//!
//! ICE candidates that arrive before their session exists are parked in a
//! per-key queue and fed into the session at start, preserving arrival
//! order.

use crate::broker::{BrokerPublisher, InboundMessage};
use crate::errors::AudioError;
use crate::media::control::{MediaControl, MediaKind};
use crate::media::registry::SourceRegistry;
use crate::media::session::{MediaSession, SessionOptions, SessionStatus};
use crate::messages::{ClientEvent, ControlMessage, SessionKey};
use futures::future;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct SessionRouter {
    mcs: Arc<dyn MediaControl>,
    registry: SourceRegistry,
    events: BrokerPublisher,
    options: SessionOptions,
    sessions: HashMap<SessionKey, Arc<MediaSession>>,
    pending_candidates: HashMap<SessionKey, Vec<serde_json::Value>>,
    cancel: CancellationToken,
}

impl SessionRouter {
    pub fn new(
        mcs: Arc<dyn MediaControl>,
        registry: SourceRegistry,
        events: BrokerPublisher,
        options: SessionOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mcs,
            registry,
            events,
            options,
            sessions: HashMap::new(),
            pending_candidates: HashMap::new(),
            cancel,
        }
    }

    /// Consume the inbound message stream until cancellation or channel
    /// close, then stop every remaining session.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundMessage>) {
        info!(target: "sfu.router", "audio control router running");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                maybe = inbound.recv() => {
                    match maybe {
                        Some(message) => self.dispatch(message),
                        None => break,
                    }
                }
            }
        }
        self.drain().await;
        info!(target: "sfu.router", "audio control router stopped");
    }

    async fn drain(&mut self) {
        self.pending_candidates.clear();
        let sessions: Vec<_> = self.sessions.drain().map(|(_, session)| session).collect();
        if sessions.is_empty() {
            return;
        }
        info!(
            target: "sfu.router",
            count = sessions.len(),
            "stopping active audio sessions"
        );
        future::join_all(sessions.iter().map(|session| session.stop())).await;
    }

    fn dispatch(&mut self, message: InboundMessage) {
        // Entries must stay visible while STOPPING so a restart collapses
        // onto the in-flight teardown; fully stopped ones are swept here.
        self.sessions
            .retain(|_, session| session.status() != SessionStatus::Stopped);

        let control: ControlMessage = match serde_json::from_value(message.payload) {
            Ok(control) => control,
            Err(e) => {
                debug!(
                    target: "sfu.router",
                    channel = %message.channel,
                    error = %e,
                    "ignoring malformed control message"
                );
                return;
            }
        };

        debug!(
            target: "sfu.router",
            channel = %message.channel,
            op = %control.id,
            connection_id = %control.connection_id,
            "control message received"
        );

        match control.id.as_str() {
            "start" => self.handle_start(control),
            "publish" => self.handle_publish(&control),
            "stop" => self.handle_stop(&control),
            "pause" => self.handle_pause(&control),
            "onIceCandidate" => self.handle_candidate(control),
            "close" => self.handle_close(&control),
            _ => self.handle_unknown(&control),
        }
    }

    fn handle_start(&mut self, control: ControlMessage) {
        let Some(key) = control.session_key() else {
            warn!(target: "sfu.router", op = %control.id, "ignoring message without a stream identifier");
            return;
        };

        let previous = match self.sessions.get(&key) {
            Some(existing) if existing.status() == SessionStatus::Starting => {
                debug!(
                    target: "sfu.router",
                    stream = %key,
                    "ignoring duplicate start while negotiating"
                );
                return;
            }
            Some(existing) => Some(Arc::clone(existing)),
            None => None,
        };

        let session = Arc::new(MediaSession::new(
            key.clone(),
            control.meeting_id.clone().unwrap_or_default(),
            control.voice_bridge.clone().unwrap_or_default(),
            self.options.clone(),
            Arc::clone(&self.mcs),
            self.registry.clone(),
            self.events.clone(),
        ));

        if let Err(e) = session.begin_start() {
            self.publish_error(&control.connection_id, &key, &e);
            return;
        }

        // Candidates that raced ahead of this start seed the session's
        // queue before any that arrive from now on.
        if let Some(candidates) = self.pending_candidates.remove(&key) {
            debug!(
                target: "sfu.router",
                stream = %key,
                count = candidates.len(),
                "feeding queued ICE candidates"
            );
            for candidate in candidates {
                session.on_ice_candidate(candidate);
            }
        }

        self.sessions.insert(key.clone(), Arc::clone(&session));

        let events = self.events.clone();
        let offer = control.sdp_offer.unwrap_or_default();
        tokio::spawn(async move {
            // A replaced session finishes tearing down before the new one
            // negotiates, so its source removal cannot clobber the new
            // registration.
            if let Some(previous) = previous {
                previous.stop().await;
            }

            match session.start(&offer).await {
                Ok(answer) => {
                    events.publish_event(&ClientEvent::start_response(
                        &key.connection_id,
                        key.role,
                        &key.stream_id,
                        &answer,
                    ));
                }
                Err(e) => {
                    warn!(target: "sfu.router", stream = %key, error = %e, "start failed");
                    events.publish_event(&ClientEvent::error(
                        &key.connection_id,
                        key.role,
                        Some(key.stream_id.clone()),
                        e.error_code(),
                        e.client_reason(),
                    ));
                }
            }
        });
    }

    /// Attach an external feed: join and publish an RTP descriptor, then
    /// register the handle so viewer sessions can bind to it. No
    /// [`MediaSession`] is constructed for these.
    fn handle_publish(&mut self, control: &ControlMessage) {
        let Some(key) = control.session_key() else {
            warn!(target: "sfu.router", op = %control.id, "ignoring message without a stream identifier");
            return;
        };

        let meeting_id = control.meeting_id.clone().unwrap_or_default();
        let descriptor = control.sdp_offer.clone().unwrap_or_default();
        let stream_id = external_stream_id(&key.stream_id).to_string();

        info!(
            target: "sfu.router",
            stream = %key,
            meeting_id = %meeting_id,
            "received publish from external source"
        );

        let mcs = Arc::clone(&self.mcs);
        let registry = self.registry.clone();
        let events = self.events.clone();
        let stream_name = key.stream_name();
        let connection_id = key.connection_id.clone();
        let role = key.role;

        tokio::spawn(async move {
            let attached = async {
                let user = mcs.join(&meeting_id).await?;
                mcs.publish(&user, &meeting_id, MediaKind::Rtp, &descriptor)
                    .await
            }
            .await;

            match attached {
                Ok(negotiated) => {
                    registry.register(&stream_id, negotiated.media.clone());
                    info!(
                        target: "sfu.router",
                        stream_id = %stream_id,
                        media = %negotiated.media,
                        "external audio source registered"
                    );
                    let meeting = (!meeting_id.is_empty()).then_some(meeting_id.as_str());
                    events.publish_event(&ClientEvent::publish_accepted(
                        &connection_id,
                        meeting,
                        &negotiated.answer,
                    ));
                }
                Err(e) => {
                    let err = AudioError::media(role, stream_name, e);
                    warn!(
                        target: "sfu.router",
                        stream_id = %stream_id,
                        error = %err,
                        "external publish failed"
                    );
                    events.publish_event(&ClientEvent::error(
                        &connection_id,
                        role,
                        Some(stream_id),
                        err.error_code(),
                        err.client_reason(),
                    ));
                }
            }
        });
    }

    fn handle_stop(&mut self, control: &ControlMessage) {
        let Some(key) = control.session_key() else {
            warn!(target: "sfu.router", op = %control.id, "ignoring message without a stream identifier");
            return;
        };

        self.pending_candidates.remove(&key);

        let Some(session) = self.sessions.get(&key) else {
            debug!(target: "sfu.router", stream = %key, "stop for unknown session ignored");
            return;
        };

        let session = Arc::clone(session);
        tokio::spawn(async move {
            session.stop().await;
        });
    }

    fn handle_pause(&mut self, control: &ControlMessage) {
        let Some(key) = control.session_key() else {
            warn!(target: "sfu.router", op = %control.id, "ignoring message without a stream identifier");
            return;
        };

        let Some(session) = self.sessions.get(&key) else {
            debug!(target: "sfu.router", stream = %key, "pause for unknown session ignored");
            return;
        };

        let paused = control.state.unwrap_or(false);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            session.pause(paused).await;
        });
    }

    fn handle_candidate(&mut self, control: ControlMessage) {
        let Some(key) = control.session_key() else {
            warn!(target: "sfu.router", op = %control.id, "ignoring message without a stream identifier");
            return;
        };

        let Some(candidate) = control.candidate else {
            debug!(target: "sfu.router", stream = %key, "ignoring ICE message without a candidate");
            return;
        };

        match self.sessions.get(&key) {
            Some(session) => session.on_ice_candidate(candidate),
            None => {
                debug!(target: "sfu.router", stream = %key, "queueing ICE candidate until its session starts");
                self.pending_candidates.entry(key).or_default().push(candidate);
            }
        }
    }

    fn handle_close(&mut self, control: &ControlMessage) {
        let connection_id = control.connection_id.clone();
        if connection_id.is_empty() {
            warn!(target: "sfu.router", "ignoring close without a connection identifier");
            return;
        }

        self.pending_candidates
            .retain(|key, _| key.connection_id != connection_id);

        let owned: Vec<Arc<MediaSession>> = self
            .sessions
            .values()
            .filter(|session| session.key().connection_id == connection_id)
            .map(Arc::clone)
            .collect();

        if owned.is_empty() {
            debug!(
                target: "sfu.router",
                connection_id = %connection_id,
                "close with no active sessions"
            );
            return;
        }

        info!(
            target: "sfu.router",
            connection_id = %connection_id,
            count = owned.len(),
            "closing sessions of connection"
        );
        tokio::spawn(async move {
            future::join_all(owned.iter().map(|session| session.stop())).await;
        });
    }

    fn handle_unknown(&self, control: &ControlMessage) {
        warn!(
            target: "sfu.router",
            op = %control.id,
            connection_id = %control.connection_id,
            "unrecognized control operation"
        );
        let err = AudioError::Validation(format!("unrecognized operation {}", control.id));
        self.events.publish_event(&ClientEvent::error(
            &control.connection_id,
            control.role,
            None,
            err.error_code(),
            err.client_reason(),
        ));
    }

    fn publish_error(&self, connection_id: &str, key: &SessionKey, err: &AudioError) {
        self.events.publish_event(&ClientEvent::error(
            connection_id,
            key.role,
            Some(key.stream_id.clone()),
            err.error_code(),
            err.client_reason(),
        ));
    }
}

/// Registry identifier for an externally published feed: the stream
/// identifier truncated at its first dash.
fn external_stream_id(stream_id: &str) -> &str {
    stream_id.split('-').next().unwrap_or(stream_id)
}
