//! JSON status server for Smart Compressor
//!
//! Exposes job submission, status, cancellation, output references, the
//! encoder listing and queue counters. Sources are referenced by path; no
//! file bytes travel over this API.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::encoders::EncoderListing;
use crate::jobs::{CompressionJob, JobStatus, JobStoreError, QueueStats};
use crate::media_probe::{probe_source, SourceMetadata};
use crate::orchestrator::{
    CancelOutcome, CompressionOrchestrator, DownloadError, OutputFile, SourceFile, SubmitError,
};
use crate::request::{CompressionRequest, EncodingMode, ValidationError};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    BindError {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<CompressionOrchestrator>,
    pub ffprobe_bin: PathBuf,
}

/// JSON error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        let status = match &err {
            SubmitError::Validation(ValidationError::SourceTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            SubmitError::Validation(_) => StatusCode::BAD_REQUEST,
            SubmitError::Store(_) | SubmitError::Planning(_) | SubmitError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match &err {
            DownloadError::NotReady { .. } => StatusCode::CONFLICT,
            DownloadError::NotFound(_) | DownloadError::Missing(_) => StatusCode::NOT_FOUND,
        };
        ApiError::new(status, err.to_string())
    }
}

/// Body of `POST /api/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub source_path: PathBuf,
    /// Name used for the output file; defaults to the source's file name.
    #[serde(default)]
    pub original_filename: Option<String>,
    /// Quality toggle. The encoding mode is always derived from it; a
    /// client-sent `mode` is ignored.
    #[serde(default)]
    pub quality: bool,
    #[serde(flatten)]
    pub request: CompressionRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct EncodersQuery {
    #[serde(default)]
    pub verify: bool,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn get_metrics(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.orchestrator.store().stats())
}

async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut request = body.request;
    request.mode = EncodingMode::from_quality_flag(body.quality);

    let metadata = match probe_source(&state.ffprobe_bin, &body.source_path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(
                "Could not probe {}: {}; planning without source metadata",
                body.source_path.display(),
                e
            );
            SourceMetadata::unknown()
        }
    };

    let original_filename = body.original_filename.unwrap_or_else(|| {
        body.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let job_id = state
        .orchestrator
        .submit(
            request,
            SourceFile {
                path: body.source_path,
                original_filename,
                metadata,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
        }),
    ))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<CompressionJob>> {
    Json(state.orchestrator.list_jobs())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CompressionJob>, ApiError> {
    state
        .orchestrator
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("Job not found: {}", id)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelOutcome>, ApiError> {
    match state.orchestrator.cancel(&id) {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e @ JobStoreError::NotFound(_)) => {
            Err(ApiError::new(StatusCode::NOT_FOUND, e.to_string()))
        }
        Err(e) => Err(ApiError::new(StatusCode::CONFLICT, e.to_string())),
    }
}

async fn download_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OutputFile>, ApiError> {
    Ok(Json(state.orchestrator.download(&id)?))
}

async fn list_encoders(
    State(state): State<AppState>,
    Query(query): Query<EncodersQuery>,
) -> Json<Vec<EncoderListing>> {
    Json(state.orchestrator.list_encoders(query.verify).await)
}

/// Creates the axum Router with every endpoint
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(get_metrics))
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/jobs/:id/download", get(download_job))
        .route("/api/encoders", get(list_encoders))
        .with_state(state)
}

/// Serve the router on `bind_addr` until the process exits.
pub async fn run_status_server(state: AppState, bind_addr: &str) -> Result<(), ServerError> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ServerError::BindError {
            addr: bind_addr.to_string(),
            source,
        })?;
    info!("Status server listening on {}", bind_addr);

    axum::serve(listener, app).await.map_err(ServerError::Serve)?;
    Ok(())
}
