//! Event types for the doccat event system
//!
//! Provides shared event definitions and the EventBus used for SSE fan-out.

mod review_types;

pub use review_types::{ReclaimReason, ReclaimedBatchInfo};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// doccat event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
/// Pipeline states and stages travel as their wire names (e.g. `"CLUSTERING"`)
/// so this crate does not depend on the service's model types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DoccatEvent {
    /// Import session created (documents may still be registering)
    SessionCreated {
        session_id: Uuid,
        firm_id: String,
        source_file_name: String,
        timestamp: DateTime<Utc>,
    },

    /// Session status changed through a compare-and-set transition
    SessionStateChanged {
        session_id: Uuid,
        old_state: String,
        new_state: String,
        timestamp: DateTime<Utc>,
    },

    /// Per-document progress inside a running stage
    ///
    /// Emitted periodically; lossy (no subscriber is fine).
    StageProgress {
        session_id: Uuid,
        stage: String,
        processed: usize,
        total: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },

    /// Stage finished and its statistics were persisted
    StageCompleted {
        session_id: Uuid,
        stage: String,
        documents_in: usize,
        documents_out: usize,
        failed_documents: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Session moved to FAILED
    SessionFailed {
        session_id: Uuid,
        stage: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Reviewer received one or more newly claimed batches
    BatchesAllocated {
        session_id: Uuid,
        user_id: String,
        batch_ids: Vec<Uuid>,
        timestamp: DateTime<Utc>,
    },

    /// Idle or finished assignments were released back to the pool
    BatchesReclaimed {
        session_id: Uuid,
        reclaimed: Vec<ReclaimedBatchInfo>,
        timestamp: DateTime<Utc>,
    },

    /// Reviewer decision applied to a document
    DocumentReviewed {
        session_id: Uuid,
        document_id: Uuid,
        action: String,
        actor: String,
        timestamp: DateTime<Utc>,
    },

    /// Cluster merge committed
    ClustersMerged {
        session_id: Uuid,
        target_cluster_id: Uuid,
        source_cluster_ids: Vec<Uuid>,
        documents_moved: u64,
        timestamp: DateTime<Utc>,
    },

    /// Reclassification threshold crossed; session entered RECLUSTERING
    ReclusteringTriggered {
        session_id: Uuid,
        reclassification_count: i64,
        round: i64,
        timestamp: DateTime<Utc>,
    },
}

impl DoccatEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            DoccatEvent::SessionCreated { .. } => "SessionCreated",
            DoccatEvent::SessionStateChanged { .. } => "SessionStateChanged",
            DoccatEvent::StageProgress { .. } => "StageProgress",
            DoccatEvent::StageCompleted { .. } => "StageCompleted",
            DoccatEvent::SessionFailed { .. } => "SessionFailed",
            DoccatEvent::BatchesAllocated { .. } => "BatchesAllocated",
            DoccatEvent::BatchesReclaimed { .. } => "BatchesReclaimed",
            DoccatEvent::DocumentReviewed { .. } => "DocumentReviewed",
            DoccatEvent::ClustersMerged { .. } => "ClustersMerged",
            DoccatEvent::ReclusteringTriggered { .. } => "ReclusteringTriggered",
        }
    }

    /// Session the event belongs to
    pub fn session_id(&self) -> Uuid {
        match self {
            DoccatEvent::SessionCreated { session_id, .. }
            | DoccatEvent::SessionStateChanged { session_id, .. }
            | DoccatEvent::StageProgress { session_id, .. }
            | DoccatEvent::StageCompleted { session_id, .. }
            | DoccatEvent::SessionFailed { session_id, .. }
            | DoccatEvent::BatchesAllocated { session_id, .. }
            | DoccatEvent::BatchesReclaimed { session_id, .. }
            | DoccatEvent::DocumentReviewed { session_id, .. }
            | DoccatEvent::ClustersMerged { session_id, .. }
            | DoccatEvent::ReclusteringTriggered { session_id, .. } => *session_id,
        }
    }
}

/// Central event distribution bus
///
/// Thin wrapper over a tokio broadcast channel. Slow subscribers lose the
/// oldest events rather than blocking emitters.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DoccatEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use doccat_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<DoccatEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: DoccatEvent,
    ) -> Result<usize, broadcast::error::SendError<DoccatEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: DoccatEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_change() -> DoccatEvent {
        DoccatEvent::SessionStateChanged {
            session_id: Uuid::new_v4(),
            old_state: "TRIAGING".to_string(),
            new_state: "DEDUPLICATING".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_errors_but_lossy_does_not_panic() {
        let bus = EventBus::new(10);
        assert!(bus.emit(state_change()).is_err());
        bus.emit_lossy(state_change());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let event = state_change();
        let expected_session = event.session_id();

        assert_eq!(bus.emit(event).unwrap(), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "SessionStateChanged");
        assert_eq!(received.session_id(), expected_session);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(DoccatEvent::BatchesReclaimed {
            session_id: Uuid::nil(),
            reclaimed: vec![ReclaimedBatchInfo {
                batch_id: Uuid::nil(),
                previous_owner: "alice".to_string(),
                reason: ReclaimReason::Idle,
            }],
            timestamp: Utc::now(),
        })
        .unwrap();

        assert_eq!(json["type"], "BatchesReclaimed");
        assert_eq!(json["reclaimed"][0]["reason"], "IDLE");
        assert_eq!(json["reclaimed"][0]["previous_owner"], "alice");
    }
}
