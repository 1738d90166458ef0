//! Data models for doccat-ingest (document categorization microservice)
//!
//! - Session pipeline state machine and per-stage statistics
//! - Documents, review batches and clusters
//! - Pipeline parameters frozen into each session

pub mod batch;
pub mod cluster;
pub mod document;
pub mod import_session;
pub mod parameters;
pub mod stats;

pub use batch::{Batch, BatchAssignment, BatchProgress, SessionProgress};
pub use cluster::{Cluster, ClusterStatus, MergeResult};
pub use document::{
    Document, NewDocument, ReviewDocument, ReviewOutcome, ReviewState, TriageLabel, ValidationStatus,
};
pub use import_session::{ImportSession, PipelineState, Stage};
pub use parameters::{
    ClusteringPolicy, PipelineParameters, ReclassifyThreshold, MIN_CLUSTER_SIZE, PARAMETERS_VERSION,
};
pub use stats::{StageStats, StageStatus};
