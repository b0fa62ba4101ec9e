//! SFU Audio Gateway Worker
//!
//! Signaling worker for audio sessions: consumes control messages from
//! Redis, negotiates sessions against the media control service, and
//! publishes responses and media events back to clients.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Connect the broker publish connection
//! 3. Connect to the media control service
//! 4. Start the broker subscriber (pattern-scoped, with reconnect policy)
//! 5. Start the session router on the inbound message stream
//! 6. Wait for shutdown signal or subscriber give-up
//!
//! # Exit Behavior
//!
//! When the broker subscription exhausts its reconnect budget the worker
//! exits with a failure status so the supervisor relaunches it with a
//! fresh connection state. Signal-driven shutdown drains every active
//! session first so the media control service is never left with orphaned
//! users.

#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use audio_gateway::broker::BrokerClient;
use audio_gateway::config::Config;
use audio_gateway::errors::AudioError;
use audio_gateway::media::{MediaControl, RemoteMediaControl, SessionOptions, SourceRegistry};
use audio_gateway::messages::TO_AUDIO_PATTERN;
use audio_gateway::router::SessionRouter;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bound on the graceful session drain during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Audio Gateway worker");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        redis_host = %config.redis_host,
        redis_port = config.redis_port,
        mcs_url = %config.mcs_url,
        recording_enabled = config.recording_enabled,
        media_flow_timeout_ms = config.media_flow_timeout_ms,
        "Configuration loaded successfully"
    );

    // Broker publish connection
    let broker = BrokerClient::new(&config).map_err(|e| {
        error!(error = %e, "Failed to create broker client");
        e
    })?;
    let (events, publisher_task) = broker.connect_publisher().await.map_err(|e| {
        error!(error = %e, "Failed to connect broker publish connection");
        e
    })?;
    info!("Broker publish connection established");

    // Media control service connection
    info!(url = %config.mcs_url, "Connecting to media control service...");
    let mcs: Arc<dyn MediaControl> = Arc::new(
        RemoteMediaControl::connect(&config.mcs_url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to media control service");
                e
            })?,
    );
    info!("Media control service connected");

    let registry = SourceRegistry::new();
    let options = SessionOptions::from_config(&config);

    // Shutdown token propagates to the subscriber, the router and every
    // session task it spawned.
    let shutdown = CancellationToken::new();

    let (inbound, subscriber_task) = broker.spawn_subscriber(shutdown.child_token());
    info!(pattern = TO_AUDIO_PATTERN, "Broker subscriber started");

    let router = SessionRouter::new(
        Arc::clone(&mcs),
        registry,
        events,
        options,
        shutdown.child_token(),
    );
    let router_task = tokio::spawn(router.run(inbound));
    info!("Audio control router started");

    info!(
        instance_id = %config.instance_id,
        "Audio gateway worker running - press Ctrl+C to shutdown"
    );

    let exit: Result<(), AudioError> = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            Ok(())
        }
        result = subscriber_task => match result {
            Ok(Ok(())) => {
                warn!("Broker subscriber ended without a shutdown signal");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(
                    error = %e,
                    "Broker subscription lost for good, exiting for supervised restart"
                );
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Broker subscriber task failed");
                Err(AudioError::Internal(format!("subscriber task failed: {e}")))
            }
        }
    };

    // Drain sessions so the media control service is not left with
    // orphaned users, then let the process exit.
    shutdown.cancel();
    match tokio::time::timeout(DRAIN_TIMEOUT, router_task).await {
        Ok(Ok(())) => info!("Session drain complete"),
        Ok(Err(e)) => warn!(error = %e, "Router task failed during drain"),
        Err(_) => warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "Timed out draining sessions"
        ),
    }
    publisher_task.abort();

    match exit {
        Ok(()) => {
            info!("Audio gateway shutdown complete");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
