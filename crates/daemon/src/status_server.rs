//! Status HTTP server
//!
//! Exposes the latest snapshot and quality fact as JSON for external consumers.
//! Handlers only read the hubs' cached values.

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hub::BroadcastHub;
use crate::model::{AudioFormatFact, PlayerSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Read handles on the two published streams.
#[derive(Clone)]
pub struct StatusState {
    pub snapshots: BroadcastHub<PlayerSnapshot>,
    pub facts: BroadcastHub<AudioFormatFact>,
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub snapshot: Option<PlayerSnapshot>,
    pub quality: Option<AudioFormatFact>,
    /// Human readable quality label, empty when unknown
    pub label: String,
}

impl StatusReport {
    pub fn collect(state: &StatusState) -> Self {
        let quality = state.facts.latest();
        let label = quality.as_ref().map(|f| f.label()).unwrap_or_default();
        Self {
            snapshot: state.snapshots.latest(),
            quality,
            label,
        }
    }
}

async fn get_status(State(state): State<StatusState>) -> Json<StatusReport> {
    Json(StatusReport::collect(&state))
}

async fn get_snapshot(State(state): State<StatusState>) -> Json<Option<PlayerSnapshot>> {
    Json(state.snapshots.latest())
}

async fn get_quality(State(state): State<StatusState>) -> Json<Option<AudioFormatFact>> {
    Json(state.facts.latest())
}

/// Creates the axum Router with the status endpoints
pub fn create_status_router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/snapshot", get(get_snapshot))
        .route("/quality", get(get_quality))
        .with_state(state)
}

/// Runs the status server on `bind` until `shutdown` is cancelled.
pub async fn run_status_server(
    state: StatusState,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_status_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
