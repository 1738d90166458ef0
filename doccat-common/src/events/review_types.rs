//! Reviewer-side event payload types
//!
//! Supporting types for batch allocation and validation events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why an assignment was released back to the unassigned pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReclaimReason {
    /// Owner had no activity for longer than the idle threshold
    Idle,
    /// Every document in the batch is categorized or skipped
    Finished,
}

/// One released assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimedBatchInfo {
    pub batch_id: Uuid,
    pub previous_owner: String,
    pub reason: ReclaimReason,
}
