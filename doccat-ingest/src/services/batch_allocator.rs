//! Batch allocation engine
//!
//! Hands review batches to reviewers on demand. Every claim is a single
//! conditional update on the batch row, so concurrent pulls from any number
//! of reviewers never share a batch and need no lock held across calls.
//! Idle and finished assignments are reclaimed lazily at the start of every
//! pull rather than by a background sweeper.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use doccat_common::events::{DoccatEvent, EventBus, ReclaimedBatchInfo};
use doccat_common::{Error, Result};

use crate::db;
use crate::db::batches::ReleasedAssignment;
use crate::db::sessions::SESSION_NOT_REVIEWABLE;
use crate::models::{Batch, BatchProgress, ImportSession, ReviewDocument, SessionProgress};
use crate::utils::retry_on_lock;

/// What a reviewer receives from a pull
#[derive(Debug, Clone, Serialize)]
pub struct BatchPull {
    pub batches: Vec<Batch>,
    pub documents: Vec<ReviewDocument>,
    pub progress: SessionProgress,
}

/// Lock-free snapshot of every batch of a session
#[derive(Debug, Clone, Serialize)]
pub struct BatchesStatus {
    pub batches: Vec<BatchProgress>,
    pub progress: SessionProgress,
}

#[derive(Clone)]
pub struct BatchAllocator {
    db: SqlitePool,
    event_bus: EventBus,
}

impl BatchAllocator {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self { db, event_bus }
    }

    pub async fn allocate_batches_to_user(&self, session_id: Uuid, user_id: &str) -> Result<BatchPull> {
        self.allocate_batches_to_user_at(session_id, user_id, Utc::now()).await
    }

    /// Return the reviewer's unfinished batches, or claim new ones up to the cap
    ///
    /// The cap is enforced by each claim statement, so concurrent pulls by
    /// one reviewer never hold more than `max_batches_per_reviewer` batches.
    /// Pulling again without an intervening change returns the same batches.
    /// A pull is not reviewer activity: only decisions keep an assignment alive.
    pub async fn allocate_batches_to_user_at(
        &self,
        session_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BatchPull> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(Error::InvalidInput("user_id must not be empty".to_string()));
        }

        let session = self.reviewable_session(session_id).await?;
        self.release_stale(&session, now).await?;

        let mut batches = db::batches::list_held_by(&self.db, session_id, user_id).await?;
        if batches.is_empty() {
            let claimed = self.claim_up_to_cap(&session, user_id, now).await?;
            if !claimed.is_empty() {
                tracing::info!(
                    session_id = %session_id,
                    user_id,
                    batches = claimed.len(),
                    "Batches allocated"
                );
                self.event_bus.emit_lossy(DoccatEvent::BatchesAllocated {
                    session_id,
                    user_id: user_id.to_string(),
                    batch_ids: claimed.iter().map(|b| b.id).collect(),
                    timestamp: Utc::now(),
                });
            }
            // A concurrent pull by the same reviewer may have claimed instead
            batches = db::batches::list_held_by(&self.db, session_id, user_id).await?;
        }

        let batch_ids: Vec<Uuid> = batches.iter().map(|b| b.id).collect();
        let documents = db::documents::list_for_batches(&self.db, &batch_ids)
            .await?
            .iter()
            .map(ReviewDocument::from)
            .collect();
        let progress = db::batches::session_progress(&self.db, session_id).await?;

        Ok(BatchPull {
            batches,
            documents,
            progress,
        })
    }

    async fn claim_up_to_cap(
        &self,
        session: &ImportSession,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Batch>> {
        let cap = session.parameters.max_batches_per_reviewer.max(1);
        let max_wait_ms = db::settings::get_max_lock_wait_ms(&self.db).await?;

        let mut claimed = Vec::with_capacity(cap);
        while claimed.len() < cap {
            let batch = retry_on_lock("claim batch", max_wait_ms, || {
                db::batches::claim_next_batch(&self.db, session.session_id, user_id, cap, now)
            })
            .await?;
            match batch {
                Some(batch) => claimed.push(batch),
                None => break,
            }
        }
        Ok(claimed)
    }

    pub async fn auto_reassign_batches(&self, session_id: Uuid) -> Result<Vec<ReleasedAssignment>> {
        self.auto_reassign_batches_at(session_id, Utc::now()).await
    }

    /// Release assignments idle longer than `idle_reclaim_secs`, and finished ones
    pub async fn auto_reassign_batches_at(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReleasedAssignment>> {
        let session = db::sessions::get_session(&self.db, session_id).await?;
        self.release_stale(&session, now).await
    }

    async fn release_stale(&self, session: &ImportSession, now: DateTime<Utc>) -> Result<Vec<ReleasedAssignment>> {
        let idle = chrono::Duration::seconds(session.parameters.idle_reclaim_secs as i64);
        let cutoff = now - idle;

        let max_wait_ms = db::settings::get_max_lock_wait_ms(&self.db).await?;
        let released = retry_on_lock("release stale assignments", max_wait_ms, || {
            db::batches::release_stale_assignments(&self.db, session.session_id, cutoff)
        })
        .await?;

        if !released.is_empty() {
            for r in &released {
                tracing::warn!(
                    session_id = %session.session_id,
                    batch_id = %r.batch_id,
                    previous_owner = %r.previous_owner,
                    reason = ?r.reason,
                    "Batch assignment reclaimed"
                );
            }
            self.event_bus.emit_lossy(DoccatEvent::BatchesReclaimed {
                session_id: session.session_id,
                reclaimed: released
                    .iter()
                    .map(|r| ReclaimedBatchInfo {
                        batch_id: r.batch_id,
                        previous_owner: r.previous_owner.clone(),
                        reason: r.reason,
                    })
                    .collect(),
                timestamp: Utc::now(),
            });
        }

        Ok(released)
    }

    /// Every batch with its counters and owner, plus session totals
    pub async fn get_all_batches_status(&self, session_id: Uuid) -> Result<BatchesStatus> {
        let progress = db::batches::session_progress(&self.db, session_id).await?;
        let batches = db::batches::list_for_session(&self.db, session_id)
            .await?
            .iter()
            .map(Batch::progress)
            .collect();
        Ok(BatchesStatus { batches, progress })
    }

    /// Keep an assignment alive; false when `user_id` does not hold the batch
    pub async fn touch_activity(&self, batch_id: Uuid, user_id: &str) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        db::batches::touch_activity_on(&mut conn, batch_id, user_id, Utc::now()).await
    }

    async fn reviewable_session(&self, session_id: Uuid) -> Result<ImportSession> {
        let session = db::sessions::get_session(&self.db, session_id).await?;
        if !session.state.is_reviewable() {
            return Err(Error::conflict(
                SESSION_NOT_REVIEWABLE,
                format!("Session {} is {}, batches are not available", session_id, session.state),
            ));
        }
        Ok(session)
    }
}
