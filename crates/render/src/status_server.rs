//! Queue HTTP surface
//!
//! JSON view of the render queue and drain status, plus enqueue, remove and
//! drain triggers for an external UI.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::drain::{DrainOptions, OverwriteDecision, QueueDrainer};
use crate::job::{JobId, RenderJob, RenderRequest};
use crate::queue::{Enqueued, RenderQueue};
use crate::status::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Everything the handlers need.
#[derive(Clone)]
pub struct AppState {
    pub queue: RenderQueue,
    pub drainer: Arc<QueueDrainer>,
    pub status: SharedStatus,
    pub options: DrainOptions,
    /// Cancels drains started over HTTP on shutdown
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(drainer: Arc<QueueDrainer>, options: DrainOptions, cancel: CancellationToken) -> Self {
        Self {
            queue: drainer.queue().clone(),
            status: drainer.status(),
            drainer,
            options,
            cancel,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DrainParams {
    overwrite: Option<OverwriteDecision>,
}

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

/// Handler for GET /queue
async fn list_queue(State(state): State<AppState>) -> Json<Vec<RenderJob>> {
    Json(state.queue.list())
}

/// Handler for POST /queue
/// - 201 with the new job
/// - 200 with `{"duplicate": true, "id": ...}` for a duplicate
/// - 400 when the source does not exist
async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<RenderRequest>,
) -> Response {
    match state.queue.enqueue(request) {
        Ok(Enqueued::Added(job)) => (StatusCode::CREATED, Json(job)).into_response(),
        Ok(Enqueued::Duplicate(id)) => (
            StatusCode::OK,
            Json(json!({ "duplicate": true, "id": id })),
        )
            .into_response(),
        Err(e) => error_body(StatusCode::BAD_REQUEST, e),
    }
}

/// Handler for DELETE /queue/:id
async fn remove_job(State(state): State<AppState>, Path(id): Path<JobId>) -> StatusCode {
    match state.queue.dequeue(id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

/// Handler for GET /status
async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    let snapshot = state.status.read().await.clone();
    Json(snapshot)
}

/// Handler for POST /drain?overwrite=yes|no
///
/// Starts a drain in the background. Without an `overwrite` answer the
/// drain runs without forcing overwrites.
async fn start_drain(
    State(state): State<AppState>,
    Query(params): Query<DrainParams>,
) -> Response {
    // Claimed here so a second request sees the conflict before this task runs.
    let Some(guard) = state.drainer.try_begin() else {
        return error_body(StatusCode::CONFLICT, "a drain is already running");
    };

    let decision = params.overwrite.unwrap_or(OverwriteDecision::No);
    let drainer = state.drainer.clone();
    let options = state.options.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        match drainer
            .drain_with(guard, options, move |_| decision, &cancel)
            .await
        {
            Ok(summary) => info!(
                rendered = summary.rendered,
                failed = summary.failed,
                "drain requested over HTTP finished"
            ),
            Err(e) => error!("drain requested over HTTP failed: {}", e),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "started": true, "jobs": state.queue.len() })),
    )
        .into_response()
}

/// Creates the axum Router with the queue and status endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/queue", get(list_queue).post(enqueue_job))
        .route("/queue/:id", delete(remove_job))
        .route("/status", get(get_status))
        .route("/drain", post(start_drain))
        .with_state(state)
}

/// Runs the status HTTP server until `shutdown` fires
///
/// # Arguments
/// * `addr` - Address to listen on
/// * `state` - Queue, drainer and status to serve
/// * `shutdown` - Token ending the server gracefully
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_status_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
