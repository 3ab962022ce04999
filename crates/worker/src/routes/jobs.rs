//! Read-only view of a dispatch job's delivery state.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use beacon_common::error::AppError;
use beacon_common::types::{DispatchJob, JobStatus, TokenFailure};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/jobs/{id}", get(get_job))
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub attempt: i32,
    pub token_count: i32,
    pub success_count: i32,
    pub failed_count: i32,
    pub error: Option<String>,
    pub dry_run: bool,
    pub last_errors: Vec<TokenFailure>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<DispatchJob> for JobView {
    fn from(job: DispatchJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            attempt: job.attempt,
            token_count: job.token_count,
            success_count: job.success_count,
            failed_count: job.failed_count,
            error: job.error,
            dry_run: job.dry_run,
            last_errors: job.last_errors,
            processing_started_at: job.processing_started_at,
            sent_at: job.sent_at,
            updated_at: job.updated_at,
        }
    }
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    let job = state
        .jobs
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;

    Ok(Json(job.into()))
}
