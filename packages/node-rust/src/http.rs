//! Health, liveness, and readiness endpoints for orchestrators.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::lifecycle::{NodeLifecycle, NodeState};
use crate::transport::ContentTransport;

/// Shared state behind the health routes.
#[derive(Clone)]
pub struct HealthState {
    pub lifecycle: Arc<NodeLifecycle>,
    pub transport: Arc<dyn ContentTransport>,
    pub service_type: &'static str,
    pub start_time: Instant,
}

impl HealthState {
    /// Creates health state, starting the uptime clock now.
    pub fn new(
        lifecycle: Arc<NodeLifecycle>,
        transport: Arc<dyn ContentTransport>,
        service_type: &'static str,
    ) -> Self {
        Self {
            lifecycle,
            transport,
            service_type,
            start_time: Instant::now(),
        }
    }
}

/// Detailed health as JSON.
///
/// Always 200; `state` and `transport_available` carry the verdict.
pub async fn health_handler(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let transport_available = state.transport.is_available().await;
    Json(json!({
        "service": state.service_type,
        "state": state.lifecycle.state().as_str(),
        "in_flight": state.lifecycle.in_flight_count(),
        "transport": state.transport.name(),
        "transport_available": transport_available,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness: the process answers.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness: 200 only while `Ready`.
pub async fn readiness_handler(State(state): State<HealthState>) -> StatusCode {
    if state.lifecycle.state() == NodeState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Routes:
/// - `GET /health` -- detailed health JSON
/// - `GET /health/live` -- liveness probe
/// - `GET /health/ready` -- readiness probe
pub fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bound health listener, served until shutdown.
pub struct HealthServer {
    listener: TcpListener,
    router: Router,
}

impl HealthServer {
    /// Binds `addr`; port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, state: HealthState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "health endpoint bound");
        Ok(Self {
            listener,
            router: build_router(state),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal I/O failure.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
