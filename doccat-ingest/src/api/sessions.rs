//! Session lifecycle API handlers
//!
//! POST /sessions, POST /sessions/:id/documents, POST /sessions/:id/{start,resume,fail,extract},
//! GET /sessions, GET /sessions/:id, GET /sessions/:id/audit

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use doccat_common::events::DoccatEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db;
use crate::db::audit::AuditEntry;
use crate::error::{ApiError, ApiResult};
use crate::models::{ImportSession, NewDocument, PipelineState, SessionProgress, StageStats};
use crate::AppState;

/// POST /sessions request
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub firm_id: String,
    pub source_file_name: String,
    #[serde(default)]
    pub source_file_size: i64,
    /// Partial parameter object layered over the firm and service defaults
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// POST /sessions/:id/documents request
#[derive(Debug, Deserialize)]
pub struct RegisterDocumentsRequest {
    pub documents: Vec<NewDocument>,
}

#[derive(Debug, Serialize)]
pub struct RegisterDocumentsResponse {
    pub session_id: Uuid,
    pub document_ids: Vec<Uuid>,
}

/// POST /sessions/:id/fail request
#[derive(Debug, Deserialize)]
pub struct FailSessionRequest {
    pub reason: String,
}

/// Response of every lifecycle command
#[derive(Debug, Serialize)]
pub struct SessionStateResponse {
    pub session_id: Uuid,
    pub state: PipelineState,
}

/// GET /sessions/:id response
#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    #[serde(flatten)]
    pub session: ImportSession,
    /// Stage currently executing, if any
    pub current_stage: Option<String>,
    pub stages: Vec<StageStats>,
    pub progress: SessionProgress,
    pub elapsed_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub firm_id: Option<String>,
}

/// POST /sessions
///
/// Parameters are resolved and frozen here; a missing clustering policy is a 400.
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<ImportSession>)> {
    let firm_id = request.firm_id.trim();
    if firm_id.is_empty() {
        return Err(ApiError::BadRequest("firm_id must not be empty".to_string()));
    }
    if request.source_file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("source_file_name must not be empty".to_string()));
    }

    let parameters = crate::config::resolve_session_parameters(
        &state.db,
        firm_id,
        state.pipeline_defaults.as_ref(),
        request.parameters.as_ref(),
    )
    .await?;

    let session = ImportSession::new(
        firm_id.to_string(),
        request.source_file_name,
        request.source_file_size.max(0),
        parameters,
    );
    db::sessions::insert_session(&state.db, &session).await?;

    tracing::info!(
        session_id = %session.session_id,
        firm_id = %session.firm_id,
        source_file_name = %session.source_file_name,
        "Session created"
    );
    state.event_bus.emit_lossy(DoccatEvent::SessionCreated {
        session_id: session.session_id,
        firm_id: session.firm_id.clone(),
        source_file_name: session.source_file_name.clone(),
        timestamp: Utc::now(),
    });

    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /sessions/:id/documents
///
/// Documents are registered by the external extractor before the pipeline starts.
pub async fn register_documents(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<RegisterDocumentsRequest>,
) -> ApiResult<Json<RegisterDocumentsResponse>> {
    if request.documents.is_empty() {
        return Err(ApiError::BadRequest("documents must not be empty".to_string()));
    }

    let document_ids = db::documents::insert_documents(&state.db, session_id, &request.documents).await?;
    tracing::info!(session_id = %session_id, count = document_ids.len(), "Documents registered");

    Ok(Json(RegisterDocumentsResponse {
        session_id,
        document_ids,
    }))
}

/// POST /sessions/:id/start (202)
pub async fn start_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SessionStateResponse>)> {
    state.orchestrator.start(session_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SessionStateResponse {
            session_id,
            state: PipelineState::Triaging,
        }),
    ))
}

/// POST /sessions/:id/resume (202)
pub async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SessionStateResponse>)> {
    let resumed = state.orchestrator.resume(session_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SessionStateResponse {
            session_id,
            state: resumed,
        }),
    ))
}

/// POST /sessions/:id/fail
pub async fn fail_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<FailSessionRequest>,
) -> ApiResult<Json<SessionStateResponse>> {
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::BadRequest("reason must not be empty".to_string()));
    }

    state.orchestrator.fail(session_id, reason).await?;
    Ok(Json(SessionStateResponse {
        session_id,
        state: PipelineState::Failed,
    }))
}

/// POST /sessions/:id/extract (202)
pub async fn extract_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SessionStateResponse>)> {
    state.orchestrator.begin_extraction(session_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SessionStateResponse {
            session_id,
            state: PipelineState::Extracting,
        }),
    ))
}

/// GET /sessions/:id
///
/// Read-only: never changes session or batch state.
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<SessionStatusResponse>> {
    let session = db::sessions::get_session(&state.db, session_id).await?;
    let stages = db::stage_stats::list_for_session(&state.db, session_id).await?;
    let progress = db::batches::session_progress(&state.db, session_id).await?;

    let end: DateTime<Utc> = session.completed_at.unwrap_or_else(Utc::now);
    let elapsed_seconds = end
        .signed_duration_since(session.started_at)
        .num_seconds()
        .max(0) as u64;

    tracing::debug!(session_id = %session_id, state = %session.state, "Status query");

    Ok(Json(SessionStatusResponse {
        current_stage: session.state.running_stage().map(|s| s.as_str().to_string()),
        session,
        stages,
        progress,
        elapsed_seconds,
    }))
}

/// GET /sessions?firm_id=
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<Vec<ImportSession>>> {
    let sessions = db::sessions::list_sessions(&state.db, query.firm_id.as_deref()).await?;
    Ok(Json(sessions))
}

/// GET /sessions/:id/audit
pub async fn get_audit_log(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    db::sessions::get_session(&state.db, session_id).await?;
    Ok(Json(db::audit::list_for_session(&state.db, session_id).await?))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session_status))
        .route("/sessions/:id/documents", post(register_documents))
        .route("/sessions/:id/start", post(start_session))
        .route("/sessions/:id/resume", post(resume_session))
        .route("/sessions/:id/fail", post(fail_session))
        .route("/sessions/:id/extract", post(extract_session))
        .route("/sessions/:id/audit", get(get_audit_log))
}
