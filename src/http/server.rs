//! The agent's own HTTP surface (spec.md §6.3): built-in processors are
//! served from the same binary at the conventional dispatch paths so they
//! can be registered as ordinary InformationCollector/Diagnoser/Recoverer
//! resources pointing back at this agent. Subtypes with no built-in
//! implementation answer 501 rather than pretending to succeed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::crd::Diagnosis;
use crate::error::Result;
use crate::metrics::Metrics;

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
}

/// Serves the agent's own processor/health surface on `--address` (spec.md
/// §6.2): `/healthz`, the dispatch-shaped stub routes, and the pprof stub.
/// Metrics are intentionally not mounted here — they live on their own
/// listener bound to `--metrics-address` (spec.md §6.3), matching how the
/// upstream project keeps the operator-facing scrape port independent of
/// the processor-facing dispatch port.
pub async fn run_http_server(address: SocketAddr, token: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/informationcollector", post(information_collector))
        .route("/informationcollector/:subtype", post(information_collector_subtype))
        .route("/diagnoser", post(diagnoser))
        .route("/diagnoser/:subtype", post(diagnoser_subtype))
        .route("/recoverer", post(recoverer))
        .route("/recoverer/:subtype", post(recoverer_subtype))
        .route("/debug/pprof/*path", get(pprof_stub))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(crate::error::KubeDiagError::IoError)?;
    info!(%address, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(crate::error::KubeDiagError::IoError)?;

    Ok(())
}

/// Serves `/metrics` on its own listener bound to `--metrics-address`
/// (spec.md §6.3), separate from the agent's processor-facing surface.
pub async fn run_metrics_server(address: SocketAddr, metrics: Arc<Metrics>, token: CancellationToken) -> Result<()> {
    let state = AppState { metrics };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(crate::error::KubeDiagError::IoError)?;
    info!(%address, "metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(crate::error::KubeDiagError::IoError)?;

    Ok(())
}

async fn healthz() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
    }
}

async fn pprof_stub(Path(_path): Path<String>) -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, "profiling endpoints are not bundled in this build")
}

/// No built-in unqualified information collector; callers must address a
/// specific subtype.
async fn information_collector() -> impl IntoResponse {
    StatusCode::NOT_IMPLEMENTED
}

async fn information_collector_subtype(
    Path(_subtype): Path<String>,
    Json(diagnosis): Json<Diagnosis>,
) -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, Json(diagnosis))
}

async fn diagnoser() -> impl IntoResponse {
    StatusCode::NOT_IMPLEMENTED
}

async fn diagnoser_subtype(
    Path(_subtype): Path<String>,
    Json(diagnosis): Json<Diagnosis>,
) -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, Json(diagnosis))
}

async fn recoverer() -> impl IntoResponse {
    StatusCode::NOT_IMPLEMENTED
}

async fn recoverer_subtype(
    Path(_subtype): Path<String>,
    Json(diagnosis): Json<Diagnosis>,
) -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, Json(diagnosis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_returns_ok() {
        assert_eq!(healthz().await, "OK");
    }
}
