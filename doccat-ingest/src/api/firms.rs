//! Firm-level parameter overrides
//!
//! GET/PUT /firms/:firm_id/parameters. The override is a partial parameter
//! object stored in the settings table; it applies to sessions created after
//! the change, never to running ones.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde_json::Value;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::models::PipelineParameters;
use crate::AppState;

/// GET /firms/:firm_id/parameters
pub async fn get_firm_parameters(
    State(state): State<AppState>,
    Path(firm_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let value = crate::db::settings::get_firm_parameters(&state.db, &firm_id)
        .await?
        .unwrap_or_else(|| Value::Object(Default::default()));
    Ok(Json(value))
}

/// PUT /firms/:firm_id/parameters
///
/// Rejected when the override would not deserialize into valid parameters.
pub async fn set_firm_parameters(
    State(state): State<AppState>,
    Path(firm_id): Path<String>,
    Json(parameters): Json<Value>,
) -> ApiResult<Json<Value>> {
    if !parameters.is_object() {
        return Err(ApiError::BadRequest(
            "parameters must be a JSON object".to_string(),
        ));
    }

    let mut candidate = serde_json::to_value(PipelineParameters::default())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let (Some(base), Some(layer)) = (candidate.as_object_mut(), parameters.as_object()) {
        for (key, value) in layer {
            base.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value::<PipelineParameters>(candidate)
        .map_err(|e| ApiError::BadRequest(format!("Invalid pipeline parameters: {}", e)))?;

    crate::db::settings::set_firm_parameters(&state.db, &firm_id, &parameters).await?;
    info!(firm_id = %firm_id, "Firm parameter override stored");

    Ok(Json(parameters))
}

pub fn firm_routes() -> Router<AppState> {
    Router::new().route(
        "/firms/:firm_id/parameters",
        get(get_firm_parameters).put(set_firm_parameters),
    )
}
