use axum::{
    routing::{get, post},
    Router,
};
use cadence_core::config::CadenceConfig;
use cadence_scheduler::{Executor, JobStore};
use std::sync::Arc;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CadenceConfig,
    pub store: Arc<JobStore>,
    pub executor: Arc<Executor>,
}

impl AppState {
    pub fn new(config: CadenceConfig, store: Arc<JobStore>, executor: Arc<Executor>) -> Self {
        Self {
            config,
            store,
            executor,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/jobs",
            get(crate::http::jobs::list_jobs).post(crate::http::jobs::create_job),
        )
        .route(
            "/jobs/{id}",
            get(crate::http::jobs::get_job)
                .patch(crate::http::jobs::update_job)
                .delete(crate::http::jobs::delete_job),
        )
        .route("/jobs/{id}/retry", post(crate::http::jobs::retry_job))
        .route("/jobs/{id}/run", post(crate::http::jobs::run_job_now))
        .route("/jobs/{id}/runs", get(crate::http::jobs::list_job_runs))
        .route("/status", get(crate::http::status::status_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
