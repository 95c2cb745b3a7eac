use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use interview_core::{
    ControlError, SessionRegistry, SessionStatus, Stage, StageError, StageStatus, TranscriptEntry,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/interview/start", post(start_interview))
        .route("/interview/{room_id}/status", get(interview_status))
        .route("/interview/{room_id}/transition", post(transition_stage))
        .route("/interview/{room_id}/stop", post(stop_interview))
        .route("/interview/{room_id}/transcript", get(interview_transcript))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Control(ControlError),
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError::Control(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Control(e) => {
                let status = match &e {
                    ControlError::NotFound(_) => StatusCode::NOT_FOUND,
                    ControlError::Stage(StageError::NotInitialized) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                    ControlError::Stage(_) | ControlError::NoFurtherStage => {
                        StatusCode::BAD_REQUEST
                    }
                    ControlError::TranscriptUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string())
            }
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", detail);
        }
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    redis_connected: bool,
    active_sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis_connected = state.registry.store_healthy().await.unwrap_or(false);
    Json(HealthResponse {
        status: "healthy",
        redis_connected,
        active_sessions: state.registry.active_sessions().await.len(),
    })
}

#[derive(Deserialize)]
struct StartRequest {
    room_id: String,
    candidate_name: Option<String>,
}

#[derive(Serialize)]
struct StageResponse {
    room_id: String,
    stage: Stage,
    message: &'static str,
    status: SessionStatus,
}

impl StageResponse {
    fn new(status: StageStatus, message: &'static str) -> Self {
        Self {
            room_id: status.room_id,
            stage: status.stage,
            message,
            status: status.status,
        }
    }
}

async fn start_interview(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let room_id = request.room_id.trim();
    if room_id.is_empty() {
        return Err(ApiError::BadRequest("room_id must not be empty".to_string()));
    }
    let status = state
        .registry
        .start(room_id, request.candidate_name.as_deref())
        .await?;
    Ok(Json(StageResponse::new(status, "Interview started")))
}

async fn interview_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<StageStatus>, ApiError> {
    Ok(Json(state.registry.status(&room_id).await?))
}

#[derive(Deserialize)]
struct TransitionParams {
    target_stage: Option<String>,
}

async fn transition_stage(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<TransitionParams>,
) -> Result<Json<StageResponse>, ApiError> {
    let target = params.target_stage.as_deref().filter(|t| !t.is_empty());
    let status = state.registry.transition(&room_id, target).await?;
    Ok(Json(StageResponse::new(status, "Stage transitioned successfully")))
}

#[derive(Serialize)]
struct StopResponse {
    room_id: String,
    message: &'static str,
    final_stage: Stage,
}

async fn stop_interview(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let final_stage = state.registry.stop(&room_id).await?;
    Ok(Json(StopResponse {
        room_id,
        message: "Interview stopped",
        final_stage,
    }))
}

#[derive(Serialize)]
struct TranscriptResponse {
    room_id: String,
    entries: Vec<TranscriptEntry>,
}

async fn interview_transcript(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<TranscriptResponse>, ApiError> {
    let entries = state.registry.transcript(&room_id).await?;
    Ok(Json(TranscriptResponse { room_id, entries }))
}
