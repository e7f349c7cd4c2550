//! Status, Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pool status reporting, and Prometheus
//! metrics. Used by container orchestrators and operators.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health summary (503 when the pool is not accepting)
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (a connection is ready or can be created)
//! - `GET /status` - Registry contents, per-connection state, pace state
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{ConnectionPool, PoolStats, PurposeStats};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Whether `acquire` is accepted.
    pub accepting: bool,
    /// Connection counts.
    pub connections: ConnectionCounts,
    /// Per-purpose utilization.
    pub purposes: Vec<PurposeStats>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Pool accepting and able to serve.
    Healthy,
    /// Pool accepting but nothing ready and no room to create.
    Degraded,
    /// Pool stopped or shutting down.
    Unhealthy,
}

/// Connection counts for the health summary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionCounts {
    /// Connections including handshakes in progress.
    pub total: usize,
    /// Connections in `Ready`.
    pub ready: usize,
    /// Connections currently leased.
    pub leased: usize,
}

// =============================================================================
// Status Server State
// =============================================================================

/// Shared state for the status server.
pub struct StatusServerState {
    version: String,
    started_at: Instant,
    pool: ConnectionPool,
}

impl StatusServerState {
    /// Create new status server state.
    #[must_use]
    pub fn new(version: String, pool: ConnectionPool) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            pool,
        }
    }
}

/// Build the status router.
#[must_use]
pub fn router(state: Arc<StatusServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// Status Server
// =============================================================================

/// Status HTTP server.
pub struct StatusServer {
    port: u16,
    state: Arc<StatusServerState>,
    cancel: CancellationToken,
}

impl StatusServer {
    /// Create a new status server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<StatusServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the status server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StatusServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), StatusServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StatusServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Status server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| StatusServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Status server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<StatusServerState>>) -> impl IntoResponse {
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

async fn readiness_handler(State(state): State<Arc<StatusServerState>>) -> impl IntoResponse {
    if is_ready(&state.pool.stats()) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn status_handler(State(state): State<Arc<StatusServerState>>) -> impl IntoResponse {
    Json(state.pool.status_report())
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

fn is_ready(stats: &PoolStats) -> bool {
    stats.accepting && (stats.ready_connections() > 0 || stats.has_spare_capacity())
}

fn determine_health_status(stats: &PoolStats) -> HealthStatus {
    if !stats.accepting {
        HealthStatus::Unhealthy
    } else if is_ready(stats) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

fn build_health_response(state: &StatusServerState) -> HealthResponse {
    let stats = state.pool.stats();
    HealthResponse {
        status: determine_health_status(&stats),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        accepting: stats.accepting,
        connections: ConnectionCounts {
            total: stats.total_connections(),
            ready: stats.ready_connections(),
            leased: stats.purposes.iter().map(|p| p.leased).sum(),
        },
        purposes: stats.purposes,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Status server errors.
#[derive(Debug, thiserror::Error)]
pub enum StatusServerError {
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
    use std::collections::BTreeMap;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::GatewayEndpoint;
    use crate::application::services::testing::{FakeTransport, Script};
    use crate::application::services::{
        HandshakeConfig, HandshakeCoordinator, PaceManager, PacingConfig, PoolConfig,
        RegistryConfig, SessionIdRegistry,
    };
    use crate::domain::connection::{ConnectionState, HandshakeTimings};
    use crate::domain::pacing::ClassificationTable;
    use crate::domain::session::Purpose;
    use crate::infrastructure::store::MemoryAllocationStore;

    fn pool() -> ConnectionPool {
        let registry = Arc::new(
            SessionIdRegistry::open(
                RegistryConfig::default(),
                Arc::new(MemoryAllocationStore::new()),
            )
            .unwrap(),
        );
        let coordinator = HandshakeCoordinator::new(
            Arc::new(FakeTransport::new(Script::Ready)),
            GatewayEndpoint::new("127.0.0.1", 4002),
            HandshakeConfig {
                timings: HandshakeTimings {
                    settle_interval: Duration::from_millis(50),
                    ..HandshakeTimings::default()
                },
                ..HandshakeConfig::default()
            },
            Arc::new(ClassificationTable::default()),
        );
        let pace = Arc::new(PaceManager::new(
            PacingConfig::default(),
            ClassificationTable::default(),
        ));
        ConnectionPool::new(PoolConfig::default(), registry, coordinator, pace)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into()));
        (status, body)
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn full_pool_without_ready_connection_is_degraded() {
        let stats = PoolStats {
            accepting: true,
            by_state: BTreeMap::from([(ConnectionState::Synchronizing, 1)]),
            purposes: vec![PurposeStats {
                purpose: Purpose::Streaming,
                capacity: 1,
                live: 0,
                leased: 0,
                idle: 0,
                creating: 1,
            }],
            connections: Vec::new(),
            recent_evictions: Vec::new(),
        };
        assert_eq!(determine_health_status(&stats), HealthStatus::Degraded);
        assert!(!is_ready(&stats));
    }

    #[tokio::test]
    async fn stopped_pool_is_unhealthy_and_not_ready() {
        let app = router(Arc::new(StatusServerState::new("test".into(), pool())));

        let (status, body) = get(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");

        let (status, _) = get(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn status_reports_connections_and_registry() {
        let pool = pool();
        pool.start().unwrap();
        let lease = pool
            .acquire(Purpose::Backfill, Duration::from_secs(5))
            .await
            .unwrap();
        let app = router(Arc::new(StatusServerState::new("test".into(), pool.clone())));

        let (status, body) = get(app.clone(), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pool"]["connections"][0]["state"], "ready");
        assert_eq!(body["pool"]["connections"][0]["leased"], true);
        assert_eq!(
            body["registry"]["allocations"][0]["session_id"],
            lease.session_id().get()
        );
        assert!(body["pacing"]["categories"].is_array());

        let (status, body) = get(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"]["leased"], 1);
    }
}
