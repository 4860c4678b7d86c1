//! Route handlers.

use crate::error::ApiError;
use crate::state::{AppState, ModelState};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use textsum_training::{CancelOutcome, JobId, JobSnapshot, JobStatus};
use tracing::{info, warn};

const DOCS: &str = "\
textsum prediction service

GET    /               redirects here
GET    /docs           this page
GET    /health         liveness, always {\"status\": \"healthy\"}
GET    /ready          200 once the prediction model is loaded, 503 before
POST   /predict        {\"text\": \"<dialogue>\"} -> {\"dialogue\", \"summary\"}
POST   /train          queue a training run -> {\"status\", \"job_id\"}
GET    /train          list training jobs
GET    /train/:job_id  status of one training job
DELETE /train/:job_id  cancel a queued or running training job
";

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub dialogue: String,
    pub summary: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrainResponse {
    pub status: String,
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

pub async fn root() -> Redirect {
    Redirect::temporary("/docs")
}

pub async fn docs() -> &'static str {
    DOCS
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let model = state.model_state().await;
    let code = if matches!(model, ModelState::Ready(_)) { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = match &model {
        ModelState::Failed(reason) => json!({ "status": model.as_str(), "reason": reason }),
        _ => json!({ "status": model.as_str() }),
    };
    (code, Json(body))
}

pub async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("Text cannot be empty".to_string()));
    }

    let pipeline = state.ready_pipeline().await?;
    let _permit = state.generation_permit().await?;
    info!(text_len = request.text.len(), "Generating summary");

    let text = request.text.clone();
    let summary = tokio::task::spawn_blocking(move || pipeline.predict(&text))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    Ok(Json(PredictResponse { dialogue: request.text, summary }))
}

pub async fn train(State(state): State<AppState>) -> Result<Json<TrainResponse>, ApiError> {
    let job_id = state.queue().submit().await.map_err(ApiError::internal)?;
    info!(job_id = %job_id, "Training requested");
    Ok(Json(TrainResponse { status: "Training started in background".to_string(), job_id }))
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.queue().list().await)
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = JobId(job_id);
    let status = state
        .queue()
        .status(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Unknown job {job_id}")))?;
    Ok(Json(JobStatusResponse { job_id, status }))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = JobId(job_id);
    match state.queue().cancel(&job_id).await {
        None => Err(ApiError::NotFound(format!("Unknown job {job_id}"))),
        Some(CancelOutcome::Cancelled) => {
            Ok((StatusCode::OK, Json(json!({ "job_id": job_id, "status": "cancelled" }))))
        }
        Some(CancelOutcome::Cancelling) => {
            Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id, "status": "cancelling" }))))
        }
        Some(CancelOutcome::AlreadyFinished(status)) => {
            warn!(job_id = %job_id, status = status.as_str(), "Cancel requested for finished job");
            Err(ApiError::Conflict(format!("Job {job_id} already finished: {}", status.as_str())))
        }
    }
}
