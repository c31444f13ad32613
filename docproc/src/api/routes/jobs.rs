//! Job submission, status and cancellation routes.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::pipeline::{JobRecord, ProcessingRequest};
use crate::progress::{JobProgressHistory, ProgressSnapshot};
use crate::queue::TaskPriority;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub user_id: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(flatten)]
    pub request: ProcessingRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelJobResponse {
    pub job_id: String,
    /// False when the job had already finished.
    pub cancelled: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/{id}", get(get_job).delete(cancel_job))
        .route("/{id}/progress", get(get_progress))
        .route("/{id}/history", get(get_history))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let job_id = state
        .services
        .coordinator
        .submit_job(body.request, &body.user_id, body.priority)
        .await?;
    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Json<Vec<JobRecord>> {
    Json(state.services.coordinator.list_jobs(&query.user_id))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<JobRecord>> {
    state
        .services
        .coordinator
        .job_status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job '{}' not found", id)))
}

/// Latest snapshot, in the same shape as pushed `progress_update` data.
async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProgressSnapshot>> {
    state
        .services
        .tracker
        .get_job_progress(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No progress for job '{}'", id)))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobProgressHistory>> {
    state
        .services
        .tracker
        .get_job_history(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No history for job '{}'", id)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<CancelJobResponse>> {
    let cancelled = state
        .services
        .coordinator
        .cancel_job(&id, &query.user_id)
        .await?;
    Ok(Json(CancelJobResponse {
        job_id: id,
        cancelled,
    }))
}
