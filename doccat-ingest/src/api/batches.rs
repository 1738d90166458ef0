//! Review batch API handlers

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db;
use crate::error::ApiResult;
use crate::models::ReviewDocument;
use crate::services::batch_allocator::BatchesStatus;
use crate::services::BatchPull;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub user_id: String,
}

/// POST /sessions/:id/batches/pull
///
/// Returns the reviewer's current batches, claiming new ones when they hold none.
pub async fn pull_batches(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<PullRequest>,
) -> ApiResult<Json<BatchPull>> {
    let pull = state
        .allocator
        .allocate_batches_to_user(session_id, &request.user_id)
        .await?;
    Ok(Json(pull))
}

/// GET /sessions/:id/batches
pub async fn batches_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<BatchesStatus>> {
    db::sessions::get_session(&state.db, session_id).await?;
    Ok(Json(state.allocator.get_all_batches_status(session_id).await?))
}

/// GET /sessions/:id/duplicates
pub async fn list_duplicates(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ReviewDocument>>> {
    db::sessions::get_session(&state.db, session_id).await?;
    let duplicates = db::documents::list_duplicates(&state.db, session_id)
        .await?
        .iter()
        .map(ReviewDocument::from)
        .collect();
    Ok(Json(duplicates))
}

pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/:id/batches/pull", post(pull_batches))
        .route("/sessions/:id/batches", get(batches_status))
        .route("/sessions/:id/duplicates", get(list_duplicates))
}
