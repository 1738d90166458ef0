//! Review batches and progress counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reviewer currently holding a batch (columns on the batch row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAssignment {
    pub user_id: String,
    pub assigned_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Immutable, fixed-membership unit of review work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Calendar month (`YYYY-MM`) of the members' received date, `undated` otherwise
    pub sort_key: String,
    /// Chunk index within `sort_key`
    pub ordinal: i64,
    pub member_count: i64,
    pub categorized_count: i64,
    pub skipped_count: i64,
    pub assignment: Option<BatchAssignment>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn remaining(&self) -> i64 {
        self.member_count - self.categorized_count - self.skipped_count
    }

    /// Every member has been categorized or skipped
    pub fn is_finished(&self) -> bool {
        self.remaining() <= 0
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            batch_id: self.id,
            sort_key: self.sort_key.clone(),
            member_count: self.member_count,
            categorized: self.categorized_count,
            skipped: self.skipped_count,
            remaining: self.remaining(),
            assigned_to: self.assignment.as_ref().map(|a| a.user_id.clone()),
            last_activity_at: self.assignment.as_ref().map(|a| a.last_activity_at),
        }
    }
}

/// Per-batch snapshot row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub sort_key: String,
    pub member_count: i64,
    pub categorized: i64,
    pub skipped: i64,
    pub remaining: i64,
    pub assigned_to: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Session-wide review counters
///
/// `categorized + skipped + remaining == total` for every consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub total: i64,
    pub categorized: i64,
    pub skipped: i64,
    pub remaining: i64,
    /// Duplicate documents, shown in their own lane
    pub duplicates: i64,
    pub batches_total: i64,
    pub batches_assigned: i64,
    pub batches_completed: i64,
}

impl SessionProgress {
    pub fn is_consistent(&self) -> bool {
        self.categorized + self.skipped + self.remaining == self.total
    }
}
