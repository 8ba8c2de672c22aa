//! HTTP probe and metrics server.
//!
//! Serves liveness/readiness for kubelet, Prometheus text exposition, and
//! the per-service status registry as JSON.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use director_core::metrics::PrometheusRecorder;
use director_core::status::{Health, ServiceStatus, StatusRegistry};

use crate::error::ControllerError;

/// Shared state behind the probe endpoints.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Readiness/liveness tracking
    pub health: Arc<Health>,
    /// Per-service phase registry
    pub status: Arc<StatusRegistry>,
    /// Prometheus registry wrapper
    pub metrics: Arc<PrometheusRecorder>,
}

/// Builds the probe router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the probe endpoints until the process exits.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Probe server listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.health.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn status(State(state): State<AppState>) -> Json<HashMap<String, ServiceStatus>> {
    Json(state.status.snapshot())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use director_core::status::Phase;

    fn state() -> AppState {
        AppState {
            health: Arc::new(Health::new(Duration::from_secs(60))),
            status: Arc::new(StatusRegistry::new()),
            metrics: Arc::new(PrometheusRecorder::new().unwrap()),
        }
    }

    #[tokio::test]
    async fn readyz_reflects_health() {
        let state = state();
        let (code, _) = readyz(State(state.clone())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        state.health.cycle_started("ns/s1");
        state.health.cycle_finished("ns/s1");
        let (code, _) = readyz(State(state)).await;
        assert_eq!(code, StatusCode::OK);
    }

    #[tokio::test]
    async fn status_serves_registry_snapshot() {
        let state = state();
        state
            .status
            .update("ns/s1", Phase::Stable, Some("pod-a".to_string()), 2, None);
        let Json(snapshot) = status(State(state)).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["ns/s1"].holder.as_deref(), Some("pod-a"));
    }
}
