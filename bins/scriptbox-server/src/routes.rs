use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/analyze", post(handlers::analyze_script))
        .route(
            "/jobs/:job_id",
            get(handlers::get_job).delete(handlers::delete_job),
        )
        .route("/jobs/:job_id/metrics", get(handlers::get_job_metrics))
        .route("/jobs/:job_id/logs", get(handlers::get_job_logs))
        .route("/jobs/:job_id/cancel", post(handlers::cancel_job))
        .route("/jobs/:job_id/results", get(handlers::get_job_results))
        .route("/ws/jobs/:job_id/logs", get(handlers::stream_job_logs))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
}
