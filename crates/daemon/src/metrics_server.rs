//! Status HTTP server
//!
//! Exposes metrics and the output collection via HTTP for monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{MetricsSnapshot, SharedMetrics};
use crate::outputs::{OutputCollection, OutputRecord};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// State shared by the route handlers
#[derive(Clone)]
pub struct AppState {
    pub metrics: SharedMetrics,
    pub outputs: Arc<OutputCollection>,
}

/// Handler for GET /metrics endpoint
/// Returns the current MetricsSnapshot as JSON
async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let snapshot = state.metrics.read().await.clone();
    Json(snapshot)
}

/// Handler for GET /outputs endpoint
/// Returns every registered output record in append order
async fn get_outputs(State(state): State<AppState>) -> Json<Vec<OutputRecord>> {
    Json(state.outputs.records())
}

/// Creates the axum Router with the status endpoints
pub fn create_metrics_router(metrics: SharedMetrics, outputs: Arc<OutputCollection>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/outputs", get(get_outputs))
        .with_state(AppState { metrics, outputs })
}

/// Runs the status HTTP server on `bind` until `cancel` fires
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_metrics_server(
    bind: &str,
    metrics: SharedMetrics,
    outputs: Arc<OutputCollection>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_metrics_router(metrics, outputs);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
