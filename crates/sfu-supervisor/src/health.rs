//! Health endpoints for the supervisor.
//!
//! Provides Kubernetes-compatible health endpoints:
//! - `GET /health` - Liveness probe (is the supervisor running?)
//! - `GET /ready` - Readiness probe (are workers launched and supervised?)
//!
//! Only one supervisor instance per host serves these endpoints. When the
//! configured port is already taken, [`serve_health`] leaves the endpoint
//! to the incumbent and this instance runs as a standby that still
//! supervises its own workers.

use crate::errors::SupervisorError;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Health state for the supervisor.
///
/// Tracks liveness and readiness for Kubernetes probes.
#[derive(Debug)]
pub struct HealthState {
    /// Whether the supervisor process is running.
    /// Always true after startup initialization.
    live: AtomicBool,
    /// Whether workers are launched and being supervised.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Mark the supervisor as ready (workers launched).
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the supervisor as not ready (e.g. during drain).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Check if the supervisor is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Check if the supervisor is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Create the health router with liveness and readiness endpoints.
///
/// - `GET /health` - Returns 200 while the process runs (liveness)
/// - `GET /ready` - Returns 200 once workers are supervised, 503 otherwise
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Bind the health endpoints and serve them until `cancel` fires.
///
/// Returns `Ok(None)` when the address is already in use: another
/// supervisor on this host owns the endpoint and this instance becomes a
/// standby. Any other bind failure is an error.
pub async fn serve_health(
    bind_address: &str,
    state: Arc<HealthState>,
    cancel: CancellationToken,
) -> Result<Option<JoinHandle<()>>, SupervisorError> {
    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!(
                target: "sfu.supervisor",
                addr = bind_address,
                "Health address already in use, running as standby"
            );
            return Ok(None);
        }
        Err(e) => return Err(SupervisorError::Health(e)),
    };

    let addr = listener.local_addr().map_err(SupervisorError::Health)?;
    info!(target: "sfu.supervisor", %addr, "Health server listening");

    let app = health_router(state);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            warn!(target: "sfu.supervisor", error = %e, "Health server error");
        }
    });

    Ok(Some(task))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_ready_toggles() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready(), "Should be ready after set_ready()");

        state.set_not_ready();
        assert!(
            !state.is_ready(),
            "Should not be ready after set_not_ready()"
        );
    }

    #[tokio::test]
    async fn test_health_router_liveness_endpoint() {
        let state = Arc::new(HealthState::new());
        let app = health_router(state);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(
            response.status(),
            StatusCode::OK,
            "/health should return 200 OK when live"
        );
    }

    #[tokio::test]
    async fn test_health_router_readiness_follows_state() {
        let state = Arc::new(HealthState::new());
        let app = health_router(Arc::clone(&state));

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        assert_eq!(
            response.status(),
            StatusCode::SERVICE_UNAVAILABLE,
            "/ready should return 503 before workers launch"
        );

        state.set_ready();
        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        assert_eq!(
            response.status(),
            StatusCode::OK,
            "/ready should return 200 once ready"
        );
    }

    #[tokio::test]
    async fn test_serve_health_standby_when_address_taken() {
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind holder listener");
        let addr = holder.local_addr().expect("Holder should have an address");

        let result = serve_health(
            &addr.to_string(),
            Arc::new(HealthState::new()),
            CancellationToken::new(),
        )
        .await;

        assert!(
            matches!(result, Ok(None)),
            "A taken address should yield standby mode, not an error"
        );
    }

    #[tokio::test]
    async fn test_serve_health_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let task = serve_health("127.0.0.1:0", Arc::new(HealthState::new()), cancel.clone())
            .await
            .expect("Bind should succeed")
            .expect("Should not enter standby on a free port");

        cancel.cancel();
        task.await.expect("Health task should stop cleanly");
    }
}
