//! Redis broker plumbing.
//!
//! Two independent connections: a publisher built on the redis connection
//! manager, fed through an in-process queue so callers never block on broker
//! IO, and a pattern subscriber that owns its reconnect loop. Outbound
//! publishes are fire-and-forget; a failed publish is logged and dropped.
//! The subscriber is the delivery-critical path and follows
//! [`ReconnectPolicy`] until it either recovers or gives up for good.

use crate::broker::policy::ReconnectPolicy;
use crate::config::Config;
use crate::errors::AudioError;
use crate::messages::{
    ClientEvent, RecordingEvent, FROM_AUDIO_CHANNEL, MEETING_EVENTS_CHANNEL, TO_AUDIO_PATTERN,
};
use futures::StreamExt;
use redis::AsyncCommands;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffer size for the inbound control message channel.
const INBOUND_CHANNEL_BUFFER: usize = 1000;

/// A decoded control message received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Concrete channel the message arrived on.
    pub channel: String,
    /// Raw JSON payload; the router performs typed decoding.
    pub payload: serde_json::Value,
}

/// An outbound publish queued for the publisher task.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: String,
    pub payload: String,
}

/// Cheap clonable handle for publishing events to the broker.
///
/// Sends never block and never fail from the caller's perspective; broker
/// trouble is handled (and logged) by the publisher task.
#[derive(Debug, Clone)]
pub struct BrokerPublisher {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl BrokerPublisher {
    pub fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { tx }
    }

    /// Serialize `payload` and queue it for the given channel.
    pub fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    target: "sfu.broker.publisher",
                    channel,
                    error = %e,
                    "failed to serialize outbound message"
                );
                return;
            }
        };

        let message = OutboundMessage {
            channel: channel.to_string(),
            payload: body,
        };
        if self.tx.send(message).is_err() {
            debug!(
                target: "sfu.broker.publisher",
                channel,
                "publisher task gone, dropping outbound message"
            );
        }
    }

    /// Publish a client event on the fixed outbound channel.
    pub fn publish_event(&self, event: &ClientEvent) {
        self.publish_json(FROM_AUDIO_CHANNEL, event);
    }

    /// Publish a recording notification on the meeting events channel.
    pub fn publish_meeting_event(&self, event: &RecordingEvent) {
        self.publish_json(MEETING_EVENTS_CHANNEL, event);
    }
}

/// Entry point for both broker connections.
pub struct BrokerClient {
    client: redis::Client,
    pattern: String,
    policy: ReconnectPolicy,
}

impl BrokerClient {
    pub fn new(config: &Config) -> Result<Self, AudioError> {
        let client = redis::Client::open(config.redis_url())
            .map_err(|e| AudioError::Broker(format!("invalid redis URL: {e}")))?;

        Ok(Self {
            client,
            pattern: TO_AUDIO_PATTERN.to_string(),
            policy: ReconnectPolicy::new(
                Duration::from_millis(config.broker_retry_ceiling_ms),
                config.broker_max_connections,
            ),
        })
    }

    /// Establish the publisher connection and spawn its queue drain task.
    ///
    /// The connection manager reconnects on its own; publishes that fail
    /// mid-outage are dropped, which matches the fire-and-forget contract.
    pub async fn connect_publisher(
        &self,
    ) -> Result<(BrokerPublisher, JoinHandle<()>), AudioError> {
        let manager = redis::aio::ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| {
                AudioError::Broker(format!("failed to establish publisher connection: {e}"))
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(publisher_loop(manager, rx));
        Ok((BrokerPublisher::new(tx), task))
    }

    /// Spawn the pattern subscriber.
    ///
    /// The task ends with `Ok(())` on cancellation and with an error once the
    /// reconnect policy is exhausted; the worker treats the latter as fatal.
    pub fn spawn_subscriber(
        &self,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<InboundMessage>,
        JoinHandle<Result<(), AudioError>>,
    ) {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_BUFFER);
        let subscriber = ControlSubscriber {
            client: self.client.clone(),
            pattern: self.pattern.clone(),
            policy: self.policy,
            tx,
            cancel,
            times_connected: 0,
        };
        (rx, tokio::spawn(subscriber.run()))
    }
}

async fn publisher_loop(
    mut conn: redis::aio::ConnectionManager,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    while let Some(message) = rx.recv().await {
        let result: Result<i64, redis::RedisError> =
            conn.publish(&message.channel, &message.payload).await;
        if let Err(e) = result {
            warn!(
                target: "sfu.broker.publisher",
                channel = %message.channel,
                error = %e,
                "dropping outbound message after publish failure"
            );
        }
    }
    debug!(target: "sfu.broker.publisher", "outbound queue closed, publisher stopping");
}

enum PumpEnd {
    /// Cancelled or the consumer went away; do not reconnect.
    Finished,
    /// The subscription stream ended; reconnect under the policy.
    Reconnect,
}

struct ControlSubscriber {
    client: redis::Client,
    pattern: String,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    times_connected: u32,
}

impl ControlSubscriber {
    async fn run(mut self) -> Result<(), AudioError> {
        loop {
            let Some(mut pubsub) = self.connect().await? else {
                return Ok(());
            };
            match self.pump(&mut pubsub).await {
                PumpEnd::Finished => return Ok(()),
                PumpEnd::Reconnect => {}
            }
        }
    }

    /// Connect and psubscribe, retrying under the policy.
    ///
    /// Returns `None` when cancelled while waiting between attempts.
    async fn connect(&mut self) -> Result<Option<redis::aio::PubSub>, AudioError> {
        let outage_started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match self.try_subscribe().await {
                Ok(pubsub) => {
                    self.times_connected += 1;
                    info!(
                        target: "sfu.broker.subscriber",
                        pattern = %self.pattern,
                        times_connected = self.times_connected,
                        "subscribed to control pattern"
                    );
                    return Ok(Some(pubsub));
                }
                Err(e) => {
                    attempt += 1;
                    let outage = outage_started.elapsed();
                    if self.policy.should_abandon(outage, self.times_connected) {
                        error!(
                            target: "sfu.broker.subscriber",
                            error = %e,
                            attempt,
                            outage_ms = outage.as_millis(),
                            times_connected = self.times_connected,
                            "broker reconnect budget exhausted, giving up"
                        );
                        return Err(AudioError::Broker(format!(
                            "reconnect budget exhausted after {attempt} attempts: {e}"
                        )));
                    }

                    let delay = self.policy.delay(attempt);
                    warn!(
                        target: "sfu.broker.subscriber",
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "broker connection failed, retrying"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_subscribe(&self) -> Result<redis::aio::PubSub, redis::RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(&self.pattern).await?;
        Ok(pubsub)
    }

    async fn pump(&mut self, pubsub: &mut redis::aio::PubSub) -> PumpEnd {
        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return PumpEnd::Finished,
                maybe = stream.next() => {
                    let Some(msg) = maybe else {
                        warn!(
                            target: "sfu.broker.subscriber",
                            "control subscription lost, reconnecting"
                        );
                        return PumpEnd::Reconnect;
                    };
                    if !self.deliver(msg).await {
                        return PumpEnd::Finished;
                    }
                }
            }
        }
    }

    /// Decode and forward one message. Returns false once the consumer is
    /// gone.
    async fn deliver(&self, msg: redis::Msg) -> bool {
        let channel = msg.get_channel_name().to_string();

        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    target: "sfu.broker.subscriber",
                    channel,
                    error = %e,
                    "discarding unreadable broker payload"
                );
                return true;
            }
        };

        let value = match serde_json::from_str::<serde_json::Value>(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    target: "sfu.broker.subscriber",
                    channel,
                    error = %e,
                    "discarding non-JSON control message"
                );
                return true;
            }
        };

        self.tx
            .send(InboundMessage {
                channel,
                payload: value,
            })
            .await
            .is_ok()
    }
}
