// HTTP route handlers for the execution service

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use futures_util::StreamExt;
use scriptbox_common::types::JobSpec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::relay::LogSubscription;
use crate::service::{ServiceError, DEFAULT_LOG_TAIL};
use crate::telemetry;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(alias = "code")]
    pub script: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn service_error(job_id: Option<&str>, err: ServiceError) -> Response {
    let status = match &err {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotDeletable(_) => StatusCode::CONFLICT,
        ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(job_id = ?job_id, error = %err, "Request failed");
    }
    error_body(status, err.to_string())
}

fn parse_job_id(job_id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(job_id).map_err(|_| {
        error_body(StatusCode::BAD_REQUEST, "Invalid job ID format".to_string())
    })
}

/// POST /jobs - Submit a script for execution
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<JobSpec>,
) -> Response {
    match state.service.submit(spec).await {
        Ok(job_id) => (
            StatusCode::CREATED,
            Json(SubmitResponse {
                job_id: job_id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => service_error(None, e),
    }
}

/// POST /jobs/analyze - Resource recommendation without submitting
pub async fn analyze_script(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AnalyzeRequest>,
) -> Response {
    let analysis = state.service.analyze(&payload.script).await;
    (StatusCode::OK, Json(analysis)).into_response()
}

/// GET /jobs/{job_id}
pub async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.get_status(id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => service_error(Some(&job_id), e),
    }
}

/// GET /jobs/{job_id}/metrics
pub async fn get_job_metrics(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.get_metrics(id).await {
        Ok(Some(metrics)) => (StatusCode::OK, Json(metrics)).into_response(),
        Ok(None) => error_body(
            StatusCode::NOT_FOUND,
            format!("No metrics recorded for job {}", id),
        ),
        Err(e) => service_error(Some(&job_id), e),
    }
}

/// GET /jobs/{job_id}/logs?tail=N
pub async fn get_job_logs(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let tail = Some(query.tail.unwrap_or(DEFAULT_LOG_TAIL));
    match state.service.get_logs(id, tail).await {
        Ok(logs) => (
            StatusCode::OK,
            Json(serde_json::json!({ "job_id": job_id, "logs": logs })),
        )
            .into_response(),
        Err(e) => service_error(Some(&job_id), e),
    }
}

/// POST /jobs/{job_id}/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.cancel(id).await {
        Ok(cancelled) => {
            info!(job_id = %job_id, cancelled, "Cancel requested");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "job_id": job_id, "cancelled": cancelled })),
            )
                .into_response()
        }
        Err(e) => service_error(Some(&job_id), e),
    }
}

/// DELETE /jobs/{job_id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => service_error(Some(&job_id), e),
    }
}

/// GET /jobs/{job_id}/results
pub async fn get_job_results(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.list_results(id).await {
        Ok(files) => (
            StatusCode::OK,
            Json(serde_json::json!({ "job_id": job_id, "files": files })),
        )
            .into_response(),
        Err(e) => service_error(Some(&job_id), e),
    }
}

/// GET /ws/jobs/{job_id}/logs - Live output over a WebSocket
pub async fn stream_job_logs(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.subscribe_logs(id).await {
        Ok(subscription) => ws.on_upgrade(move |socket| forward_events(socket, subscription)),
        Err(e) => service_error(Some(&job_id), e),
    }
}

async fn forward_events(mut socket: WebSocket, mut subscription: LogSubscription) {
    while let Some(event) = subscription.next().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode log event");
                continue;
            }
        };
        if socket.send(Message::Text(text)).await.is_err() {
            debug!("Log subscriber disconnected");
            return;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// GET /status - Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let runtime = state.service.runtime_reachable().await;
    let gpu = state.service.gpu_available().await;
    let running = state.service.running_jobs().await.len();
    let profiles: Vec<_> = state.service.profiles().profiles().map(|p| p.name).collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": if runtime { "ok" } else { "degraded" },
            "runtime_reachable": runtime,
            "gpu_available": gpu,
            "running_jobs": running,
            "profiles": profiles,
        })),
    )
}

/// GET /metrics - Prometheus text exposition
pub async fn prometheus_metrics() -> impl IntoResponse {
    (StatusCode::OK, telemetry::gather())
}
