//! Health Check and Metrics Endpoint
//!
//! Plain HTTP alongside the gRPC listeners for orchestrators and scrapers.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status with per-listener lifecycle state
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (both listeners serving)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::lifecycle::ServerState;
use crate::infrastructure::grpc::{InstanceHandle, ServerHandle};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Process uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Listener states.
    pub listeners: ListenersStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Both listeners serving.
    Healthy,
    /// One listener serving.
    Degraded,
    /// No listener serving.
    Unhealthy,
}

/// State of each gRPC listener.
#[derive(Debug, Clone, Serialize)]
pub struct ListenersStatus {
    /// Peer listener.
    pub peer: ListenerInfo,
    /// Enrollment listener.
    pub bootstrap: ListenerInfo,
}

/// One listener.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    /// Lifecycle state.
    pub state: ServerState,
    /// Bound address, once bound.
    pub addr: Option<SocketAddr>,
}

impl From<&ServerHandle> for ListenerInfo {
    fn from(handle: &ServerHandle) -> Self {
        Self {
            state: handle.state(),
            addr: handle.local_addr(),
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    instance: InstanceHandle,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, instance: InstanceHandle) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            instance,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.instance.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let listeners = ListenersStatus {
        peer: ListenerInfo::from(state.instance.peer()),
        bootstrap: ListenerInfo::from(state.instance.bootstrap()),
    };

    HealthResponse {
        status: determine_health_status(&listeners),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        listeners,
    }
}

fn determine_health_status(listeners: &ListenersStatus) -> HealthStatus {
    let serving = [listeners.peer.state, listeners.bootstrap.state]
        .iter()
        .filter(|&&s| s == ServerState::Serving)
        .count();

    match serving {
        2 => HealthStatus::Healthy,
        1 => HealthStatus::Degraded,
        _ => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(state: ServerState) -> ListenerInfo {
        ListenerInfo { state, addr: None }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_both_serving() {
        let listeners = ListenersStatus {
            peer: listener(ServerState::Serving),
            bootstrap: listener(ServerState::Serving),
        };
        assert_eq!(determine_health_status(&listeners), HealthStatus::Healthy);
    }

    #[test]
    fn determine_status_one_draining() {
        let listeners = ListenersStatus {
            peer: listener(ServerState::Serving),
            bootstrap: listener(ServerState::Draining),
        };
        assert_eq!(determine_health_status(&listeners), HealthStatus::Degraded);
    }

    #[test]
    fn determine_status_none_serving() {
        let listeners = ListenersStatus {
            peer: listener(ServerState::Stopped),
            bootstrap: listener(ServerState::Created),
        };
        assert_eq!(determine_health_status(&listeners), HealthStatus::Unhealthy);
    }

    #[test]
    fn listener_info_serializes_state_lowercase() {
        let json = serde_json::to_value(listener(ServerState::Draining)).unwrap();
        assert_eq!(json["state"], "draining");
        assert!(json["addr"].is_null());
    }
}
