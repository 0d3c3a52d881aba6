pub mod health;
pub mod jobs;
pub mod status;

use axum::http::StatusCode;
use axum::Json;
use cadence_scheduler::SchedulerError;
use serde::Serialize;

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Map scheduler errors onto the REST surface. `Database` and serialization
/// failures are systemic and surface as 500 — everything else is the
/// caller's problem.
pub fn error_response(e: SchedulerError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &e {
        SchedulerError::JobNotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::Schedule(_) => StatusCode::BAD_REQUEST,
        SchedulerError::AlreadyRunning { .. } => StatusCode::CONFLICT,
        SchedulerError::Database(_) | SchedulerError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
        }),
    )
}
