//! Job endpoints: creation, inspection, run, completeness check and reset.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use conduit_core::{CompletenessReport, Job, JobStatusDocument, ResetResponse, Tenant, Tier};

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub tenant_id: Uuid,
    pub tier: Tier,
    /// Generated when omitted.
    #[serde(default)]
    pub integration_id: Option<Uuid>,
    pub source: String,
    #[serde(default)]
    pub schedule_interval_secs: Option<i64>,
    /// Start the first run immediately.
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scheduler = &state.pipeline.scheduler;
    let tenant = Tenant::new(body.tenant_id, body.tier);
    let integration_id = body.integration_id.unwrap_or_else(Uuid::now_v7);
    let mut job = scheduler
        .create_job(&tenant, integration_id, &body.source, body.schedule_interval_secs)
        .await?;
    if body.start {
        job = scheduler.start_job(job.id).await?;
    }
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let limit = query.limit.clamp(1, 1000);
    Ok(Json(state.pipeline.tracker.jobs().list(limit).await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.pipeline.tracker.load(id).await?))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobStatusDocument>, ApiError> {
    Ok(Json(state.pipeline.tracker.load(id).await?.status))
}

pub async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.pipeline.scheduler.start_job(id).await?))
}

pub async fn check_completion(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CompletenessReport>, ApiError> {
    Ok(Json(state.pipeline.completion.check_completion(id).await?))
}

pub async fn reset_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResetResponse>, ApiError> {
    Ok(Json(state.pipeline.completion.reset(id).await?))
}
