use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use cadence_scheduler::StatusSummary;

use crate::app::AppState;
use crate::http::{error_response, ErrorBody};

/// GET /status — aggregate scheduler state: job counts and the next global
/// wakeup time (earliest pending `next_run_at`).
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusSummary>, (StatusCode, Json<ErrorBody>)> {
    let summary = state
        .store
        .status_summary()
        .await
        .map_err(error_response)?;
    Ok(Json(summary))
}
