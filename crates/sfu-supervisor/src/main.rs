//! SFU Process Supervisor
//!
//! Parent process for the SFU media workers. Launches every configured
//! worker binary, restarts workers that exit with the restart code, and
//! serves health probes for the host.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Launch all configured workers
//! 3. Bind the health endpoints (or become a standby if taken)
//! 4. Supervise worker exits until a shutdown signal arrives
//!
//! # Exit Behavior
//!
//! On SIGTERM or Ctrl+C the supervisor marks itself not ready, SIGTERMs
//! every worker, waits out the configured grace period, kills stragglers,
//! and exits cleanly.

#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use sfu_supervisor::config::SupervisorConfig;
use sfu_supervisor::health::{serve_health, HealthState};
use sfu_supervisor::supervisor::SupervisorHandle;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Extra time past the worker grace period before giving up on the drain.
const DRAIN_MARGIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_supervisor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU process supervisor");

    // Load configuration
    let config = SupervisorConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        workers = ?config.worker_paths,
        health_bind_address = %config.health_bind_address,
        worker_grace_ms = config.worker_grace_ms,
        "Configuration loaded successfully"
    );

    // Launch workers and the supervision loop
    let (supervisor, supervisor_task) = SupervisorHandle::spawn(&config).await.map_err(|e| {
        error!(error = %e, "Failed to launch workers");
        e
    })?;

    // Health endpoints. A taken port means another supervisor on this host
    // already serves them and this instance runs as a standby.
    let health_state = Arc::new(HealthState::new());
    let _health_task = serve_health(
        &config.health_bind_address,
        Arc::clone(&health_state),
        supervisor.child_token(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start health server");
        e
    })?;
    health_state.set_ready();

    info!("SFU supervisor running - press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    health_state.set_not_ready();
    supervisor.shutdown();

    let drain_budget = config.worker_grace() + DRAIN_MARGIN;
    match tokio::time::timeout(drain_budget, supervisor_task).await {
        Ok(Ok(())) => info!("Worker drain complete"),
        Ok(Err(e)) => warn!(error = %e, "Supervisor task failed during drain"),
        Err(_) => warn!(
            timeout_secs = drain_budget.as_secs(),
            "Timed out waiting for worker drain"
        ),
    }

    info!("SFU supervisor shutdown complete");
    Ok(())
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
