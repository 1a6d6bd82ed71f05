//! Health Check and Metrics Endpoint
//!
//! Thin HTTP adapter over the manager contract. Used by container
//! orchestrators, load balancers and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET|HEAD /health` - 200 if at least one connection is open, else 503
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /metrics?format=json|prometheus` - backend counters; never fails
//! - `GET /streams` - per-stream state and subscriber counts
//! - `POST /backend/{name}` - switch the active backend (`manager`|`legacy`)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Backend, ManagerError, StreamManager};
use crate::application::services::CompatibilityRouter;
use crate::infrastructure::metrics::get_metrics_handle;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// "healthy" if at least one connection is open.
    pub status: HealthStatus,
    /// Backend serving the manager contract.
    pub backend: Backend,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Connections currently registered.
    pub active_connections: u64,
    /// Registered streams.
    pub streams: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// At least one connection is open.
    Healthy,
    /// No connection is open.
    Unhealthy,
}

/// `format` query parameter of `/metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetricsFormat {
    /// `MetricsSnapshot` as JSON.
    #[default]
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

impl MetricsFormat {
    /// Parse the `format` parameter. Missing or unknown values select JSON.
    #[must_use]
    pub fn from_param(param: Option<&str>) -> Self {
        match param.map(|p| p.trim().to_ascii_lowercase()).as_deref() {
            Some("prometheus") => Self::Prometheus,
            _ => Self::Json,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Switches the active backend at runtime.
pub trait BackendControl: Send + Sync {
    /// Make `backend` the active backend.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError` if the backend cannot be built.
    fn switch_to(&self, backend: Backend) -> Result<(), ManagerError>;
}

impl BackendControl for CompatibilityRouter {
    fn switch_to(&self, backend: Backend) -> Result<(), ManagerError> {
        Self::switch_to(self, backend)
    }
}

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    manager: Arc<dyn StreamManager>,
    control: Option<Arc<dyn BackendControl>>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, manager: Arc<dyn StreamManager>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            manager,
            control: None,
        }
    }

    /// Enable `POST /backend/{name}`.
    #[must_use]
    pub fn with_backend_control(mut self, control: Arc<dyn BackendControl>) -> Self {
        self.control = Some(control);
        self
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
        let app = build_router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the HTTP routes over `state`.
pub fn build_router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/streams", get(streams_handler))
        .route("/backend/{name}", post(backend_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics_handler(
    State(state): State<Arc<HealthServerState>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    match MetricsFormat::from_param(query.format.as_deref()) {
        MetricsFormat::Json => Json(state.manager.metrics()).into_response(),
        MetricsFormat::Prometheus => {
            let mut body = state.manager.prometheus_metrics();
            if let Some(handle) = get_metrics_handle() {
                body.push_str(&handle.render());
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
                body,
            )
                .into_response()
        }
    }
}

async fn streams_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(state.manager.streams())
}

async fn backend_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(backend) = Backend::parse(&name) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown backend {name:?}, expected \"manager\" or \"legacy\""),
        );
    };
    let Some(control) = &state.control else {
        return error_response(
            StatusCode::NOT_FOUND,
            "backend switching is not enabled".to_string(),
        );
    };

    match control.switch_to(backend) {
        Ok(()) => {
            tracing::info!(backend = backend.as_str(), "Backend switched over HTTP");
            Json(serde_json::json!({ "backend": backend })).into_response()
        }
        Err(e) => {
            tracing::warn!(backend = backend.as_str(), error = %e, "Backend switch failed");
            error_response(StatusCode::CONFLICT, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let healthy = state.manager.status();
    HealthResponse {
        status: if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        },
        backend: state.manager.backend(),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        active_connections: state.manager.metrics().active_connections,
        streams: state.manager.streams().len(),
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
