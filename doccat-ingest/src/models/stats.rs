//! Per-stage statistics
//!
//! Each stage owns one row keyed by (session, stage); stages never write each
//! other's statistics.

use super::import_session::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Running,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Running => "RUNNING",
            StageStatus::Succeeded => "SUCCEEDED",
            StageStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(StageStatus::Running),
            "SUCCEEDED" => Some(StageStatus::Succeeded),
            "FAILED" => Some(StageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: Stage,
    pub status: StageStatus,
    pub documents_in: i64,
    pub documents_out: i64,
    pub failed_documents: i64,
    /// Already done by an earlier (interrupted) run
    pub skipped_documents: i64,
    pub error_count: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Stage-specific figures (e.g. duplicate groups, clusters formed)
    pub details: serde_json::Value,
}
