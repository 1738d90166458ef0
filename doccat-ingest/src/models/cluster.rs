//! Clusters of similar canonical documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Pending,
    Approved,
    Rejected,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "PENDING",
            ClusterStatus::Approved => "APPROVED",
            ClusterStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ClusterStatus::Pending),
            "APPROVED" => Some(ClusterStatus::Approved),
            "REJECTED" => Some(ClusterStatus::Rejected),
            _ => None,
        }
    }
}

/// One row of `clusters`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub session_id: Uuid,
    pub suggested_name: Option<String>,
    pub approved_name: Option<String>,
    pub name_translation: Option<String>,
    pub description: Option<String>,
    pub status: ClusterStatus,
    pub document_count: i64,
    pub sample_document_ids: Vec<Uuid>,
    /// Hash of the sorted member ids the current name was produced for
    pub membership_hash: Option<String>,
    pub deleted: bool,
    pub deleted_by: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Set when this cluster was merged away
    pub merged_into: Option<Uuid>,
    /// Reclustering round that created the cluster (0 = initial clustering)
    pub created_round: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// Name shown to reviewers
    pub fn display_name(&self) -> Option<&str> {
        self.approved_name
            .as_deref()
            .or(self.suggested_name.as_deref())
    }

    /// Still a merge target/source candidate
    pub fn is_live(&self) -> bool {
        self.merged_into.is_none() && !self.deleted
    }
}

/// Outcome of merging source clusters into a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub target_cluster_id: Uuid,
    pub source_cluster_ids: Vec<Uuid>,
    pub documents_moved: u64,
    pub target_document_count: i64,
}
