//! Reviewer decision API handlers

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::ReviewDocument;
use crate::services::DocumentAction;
use crate::AppState;

/// POST /documents/:id/decision request
///
/// `{ "actor": "alice", "action": "RECLASSIFY", "note": "...", "target_cluster_id": "..." }`
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub actor: String,
    #[serde(flatten)]
    pub action: DocumentAction,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub document: ReviewDocument,
    pub reclustering_triggered: bool,
}

pub async fn decide_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<Json<DecisionResponse>> {
    let decision = state
        .validation
        .apply_document_action(document_id, &request.actor, request.action)
        .await?;

    let reclustering_triggered = decision.reclustering_triggered.is_some();
    if reclustering_triggered {
        state.orchestrator.spawn_reclustering(decision.document.session_id);
    }

    Ok(Json(DecisionResponse {
        document: ReviewDocument::from(&decision.document),
        reclustering_triggered,
    }))
}

pub fn validation_routes() -> Router<AppState> {
    Router::new().route("/documents/:id/decision", post(decide_document))
}
