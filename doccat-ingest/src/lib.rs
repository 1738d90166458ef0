//! doccat-ingest library interface
//!
//! Exposes the service internals so integration tests can drive the pipeline,
//! the batch allocator and the validation workflow without HTTP.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use doccat_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::services::{BatchAllocator, BlobStore, PipelineOrchestrator, ScoringClient, ValidationWorkflow};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub orchestrator: PipelineOrchestrator,
    pub allocator: BatchAllocator,
    pub validation: ValidationWorkflow,
    /// `[pipeline]` table from the TOML file, as JSON
    pub pipeline_defaults: Option<serde_json::Value>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        scoring: Arc<dyn ScoringClient>,
        storage: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            orchestrator: PipelineOrchestrator::new(db.clone(), event_bus.clone(), scoring, storage),
            allocator: BatchAllocator::new(db.clone(), event_bus.clone()),
            validation: ValidationWorkflow::new(db.clone(), event_bus.clone()),
            db,
            event_bus,
            pipeline_defaults: None,
            startup_time: Utc::now(),
        }
    }

    pub fn with_pipeline_defaults(mut self, defaults: Option<serde_json::Value>) -> Self {
        self.pipeline_defaults = defaults;
        self
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::session_routes())
        .merge(api::batch_routes())
        .merge(api::validation_routes())
        .merge(api::cluster_routes())
        .merge(api::firm_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}
