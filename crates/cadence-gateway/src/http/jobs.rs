//! Job management endpoints — CRUD plus retry, run-now, and run history.
//!
//! Mutations go straight to the `JobStore` under its serialization lock; the
//! engine notices changes on its next wakeup (bounded by the 60 s sleep cap).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use cadence_scheduler::{ExecutionRecord, Job, JobPatch, NewJob, RunCause};

use crate::app::AppState;
use crate::http::{error_response, ErrorBody};

type HandlerResult<T> = Result<T, (StatusCode, Json<ErrorBody>)>;

#[derive(Serialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
}

#[derive(Serialize)]
pub struct RunList {
    pub runs: Vec<ExecutionRecord>,
}

#[derive(Deserialize)]
pub struct RunsQuery {
    #[serde(default = "default_runs_limit")]
    pub limit: usize,
}

fn default_runs_limit() -> usize {
    50
}

/// POST /jobs — create a job. The trigger is validated here; a malformed
/// expression or an already-elapsed one-shot instant is a 400.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(new_job): Json<NewJob>,
) -> HandlerResult<(StatusCode, Json<Job>)> {
    let job = state.store.create(new_job).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs — all jobs, oldest first.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> HandlerResult<Json<JobList>> {
    let jobs = state.store.list().await.map_err(error_response)?;
    Ok(Json(JobList { jobs }))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<Json<Job>> {
    let job = state.store.get(&id).await.map_err(error_response)?;
    Ok(Json(job))
}

/// PATCH /jobs/{id} — partial update of definition fields only; runtime
/// state belongs to the engine.
pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> HandlerResult<Json<Job>> {
    let job = state
        .store
        .update(&id, patch)
        .await
        .map_err(error_response)?;
    Ok(Json(job))
}

/// DELETE /jobs/{id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<StatusCode> {
    state.store.delete(&id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /jobs/{id}/retry — zero the error counters and reschedule
/// immediately; the engine picks the job up on its next wakeup.
pub async fn retry_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<Json<Job>> {
    let job = state
        .store
        .reset_errors(&id, chrono::Utc::now())
        .await
        .map_err(error_response)?;
    Ok(Json(job))
}

/// POST /jobs/{id}/run — manual dispatch, bypassing the due-check. A job
/// that is already running is a 409; the regular schedule is not disturbed.
pub async fn run_job_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HandlerResult<Json<ExecutionRecord>> {
    let job = state.store.get(&id).await.map_err(error_response)?;
    let record = state
        .executor
        .run(&job, RunCause::Manual)
        .await
        .map_err(error_response)?;
    Ok(Json(record))
}

/// GET /jobs/{id}/runs?limit=N — execution history, newest first.
pub async fn list_job_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> HandlerResult<Json<RunList>> {
    // 404 for unknown jobs rather than an empty list.
    state.store.get(&id).await.map_err(error_response)?;
    let runs = state
        .store
        .list_runs(&id, query.limit)
        .await
        .map_err(error_response)?;
    Ok(Json(RunList { runs }))
}
