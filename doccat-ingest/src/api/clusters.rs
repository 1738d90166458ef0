//! Cluster review API handlers

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{Cluster, MergeResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListClustersQuery {
    /// Include soft-deleted and merged clusters
    #[serde(default)]
    pub include_hidden: bool,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub actor: String,
    pub target_cluster_id: Uuid,
    pub source_cluster_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ClusterActionRequest {
    pub actor: String,
    /// Approval only: overrides the suggested name
    #[serde(default)]
    pub name: Option<String>,
}

/// GET /sessions/:id/clusters
pub async fn list_clusters(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<ListClustersQuery>,
) -> ApiResult<Json<Vec<Cluster>>> {
    db::sessions::get_session(&state.db, session_id).await?;
    let clusters = db::clusters::list_for_session(&state.db, session_id, query.include_hidden).await?;
    Ok(Json(clusters))
}

/// POST /sessions/:id/clusters/merge
pub async fn merge_clusters(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<MergeRequest>,
) -> ApiResult<Json<MergeResult>> {
    let result = state
        .validation
        .merge_clusters(
            session_id,
            request.target_cluster_id,
            &request.source_cluster_ids,
            &request.actor,
        )
        .await?;
    Ok(Json(result))
}

/// POST /clusters/:id/:action (approve | reject | delete | restore)
pub async fn cluster_action(
    State(state): State<AppState>,
    Path((cluster_id, action)): Path<(Uuid, String)>,
    Json(request): Json<ClusterActionRequest>,
) -> ApiResult<Json<Cluster>> {
    let validation = &state.validation;
    let cluster = match action.as_str() {
        "approve" => validation.approve_cluster(cluster_id, &request.actor, request.name).await?,
        "reject" => validation.reject_cluster(cluster_id, &request.actor).await?,
        "delete" => validation.soft_delete_cluster(cluster_id, &request.actor).await?,
        "restore" => validation.restore_cluster(cluster_id, &request.actor).await?,
        other => {
            return Err(ApiError::NotFound(format!("Unknown cluster action: {}", other)));
        }
    };
    Ok(Json(cluster))
}

pub fn cluster_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/:id/clusters", get(list_clusters))
        .route("/sessions/:id/clusters/merge", post(merge_clusters))
        .route("/clusters/:id/:action", post(cluster_action))
}
