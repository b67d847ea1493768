use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::bridge;
use super::models::NewExecution;
use super::service::{Caller, WorkflowService};
use crate::errors::WorkflowError;

/// Header carrying the authenticated caller's identity.
pub const OWNER_HEADER: &str = "x-owner-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: WorkflowService,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitAnswersRequest {
    pub answers: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Rejected(String),
    AnswerCount { expected: usize, received: usize },
    Conflict(String),
    LoginRequired,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({"error": msg})),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({"error": msg}))
            }
            ApiError::Rejected(reason) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": reason, "status": "rejected"}),
            ),
            ApiError::AnswerCount { expected, received } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": format!("Expected {} answers, received {}", expected, received),
                    "expected": expected,
                    "received": received,
                }),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({"error": msg})),
            ApiError::LoginRequired => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({"error": "Login required", "status": "login_required"}),
            ),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({"error": msg}))
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Rejected { reason } => ApiError::Rejected(reason),
            WorkflowError::AnswerCountMismatch { expected, received } => {
                ApiError::AnswerCount { expected, received }
            }
            WorkflowError::AlreadyAnswered { .. } => ApiError::BadRequest(err.to_string()),
            WorkflowError::Precondition { .. } => ApiError::Conflict(err.to_string()),
            WorkflowError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            // Runs owned by someone else are not disclosed.
            WorkflowError::Forbidden => ApiError::NotFound("Execution not found".into()),
            WorkflowError::LoginRequired => ApiError::LoginRequired,
            WorkflowError::Stage(_) | WorkflowError::Other(_) => {
                tracing::error!(error = %err, "request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

fn caller(headers: &HeaderMap) -> Caller {
    Caller::from_header(headers.get(OWNER_HEADER).and_then(|v| v.to_str().ok()))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/workflows", post(start_workflow))
        .route("/api/workflows/{run_id}", get(get_status))
        .route("/api/workflows/{run_id}/answers", post(submit_answers))
        .route("/api/workflows/{run_id}/resume", post(resume_workflow))
        .route("/api/workflows/{run_id}/cancel", post(cancel_workflow))
        .route("/api/workflows/{run_id}/claim", post(claim_workflow))
        .route("/api/workflows/{run_id}/result", get(get_result))
        .route("/api/workflows/{run_id}/events", get(stream_events))
        .route("/api/workflows/{run_id}/ws", get(stream_websocket))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn start_workflow(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<NewExecution>,
) -> Result<impl IntoResponse, ApiError> {
    let started = state.service.start(&caller(&headers), req).await?;
    Ok((StatusCode::CREATED, Json(started)))
}

async fn get_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_status(&caller(&headers), &run_id).await?))
}

async fn submit_answers(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Json(req): Json<SubmitAnswersRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state
        .service
        .submit_answers(&caller(&headers), &run_id, req.answers)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn resume_workflow(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.resume(&caller(&headers), &run_id).await?))
}

async fn cancel_workflow(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.service.cancel(&caller(&headers), &run_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"run_id": run_id, "cancelled": cancelled})),
    ))
}

async fn claim_workflow(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.claim(&caller(&headers), &run_id).await?))
}

async fn get_result(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.result(&caller(&headers), &run_id).await?))
}

async fn stream_events(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let frames = state.service.subscribe(&caller(&headers), &run_id).await?;
    Ok(bridge::into_sse(frames))
}

async fn stream_websocket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let frames = state.service.subscribe(&caller(&headers), &run_id).await?;
    Ok(ws.on_upgrade(move |socket| bridge::pump_websocket(socket, frames)))
}

// ── Tests ─────────────────────────────────────────────────────────────
