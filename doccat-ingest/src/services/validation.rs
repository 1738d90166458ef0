//! Validation workflow
//!
//! Reviewer decisions on documents and clusters. Every mutation is one
//! transaction that opens with a guarded write on the session row (the
//! session must be READY_FOR_VALIDATION or RECLUSTERING), so the decision,
//! the batch counters and the audit entry commit together or not at all.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use uuid::Uuid;

use doccat_common::events::{DoccatEvent, EventBus};
use doccat_common::time::to_db;
use doccat_common::{Error, Result};

use crate::db;
use crate::models::{Cluster, Document, ImportSession, MergeResult, ReviewOutcome};
use crate::utils::{begin_monitored, retry_on_lock};

/// Conflict code: the document's batch is held by another reviewer
pub const BATCH_CONFLICT: &str = "BATCH_CONFLICT";

/// Generic conflict code for decisions that contradict the current state
pub const CONFLICT: &str = "CONFLICT";

/// Reviewer decision on one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentAction {
    Accept,
    /// Soft delete
    Delete,
    /// Move to another category; with no target the document is regrouped
    /// at the next reclustering round
    Reclassify {
        note: String,
        #[serde(default)]
        target_cluster_id: Option<Uuid>,
    },
    /// Defer; counts as skipped until a later decision categorizes it
    Skip,
}

impl DocumentAction {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentAction::Accept => "ACCEPT",
            DocumentAction::Delete => "DELETE",
            DocumentAction::Reclassify { .. } => "RECLASSIFY",
            DocumentAction::Skip => "SKIP",
        }
    }

    fn outcome(&self) -> ReviewOutcome {
        match self {
            DocumentAction::Skip => ReviewOutcome::Skipped,
            _ => ReviewOutcome::Categorized,
        }
    }
}

/// Result of a document decision
#[derive(Debug, Clone)]
pub struct DocumentDecision {
    pub document: Document,
    /// `(reclassification_count, round)` when this decision started reclustering
    pub reclustering_triggered: Option<(i64, i64)>,
}

#[derive(Clone)]
pub struct ValidationWorkflow {
    db: SqlitePool,
    event_bus: EventBus,
}

impl ValidationWorkflow {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self { db, event_bus }
    }

    /// Apply a reviewer decision to a document
    pub async fn apply_document_action(
        &self,
        document_id: Uuid,
        actor: &str,
        action: DocumentAction,
    ) -> Result<DocumentDecision> {
        let actor = require_actor(actor)?;
        if let DocumentAction::Reclassify { note, .. } = &action {
            if note.trim().is_empty() {
                return Err(Error::InvalidInput(
                    "A reclassification note is required".to_string(),
                ));
            }
        }

        let session_id = db::documents::session_of(&self.db, document_id).await?;
        let session = db::sessions::get_session(&self.db, session_id).await?;

        let max_wait_ms = db::settings::get_max_lock_wait_ms(&self.db).await?;
        let decision = retry_on_lock("document decision", max_wait_ms, || {
            self.apply_document_action_once(&session, document_id, actor, &action)
        })
        .await?;

        tracing::info!(
            session_id = %session_id,
            document_id = %document_id,
            actor,
            action = action.name(),
            "Document decision applied"
        );
        self.event_bus.emit_lossy(DoccatEvent::DocumentReviewed {
            session_id,
            document_id,
            action: action.name().to_string(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
        });

        if let Some((reclassification_count, round)) = decision.reclustering_triggered {
            tracing::info!(
                session_id = %session_id,
                reclassification_count,
                round,
                "Reclassification threshold crossed, reclustering"
            );
            self.event_bus.emit_lossy(DoccatEvent::SessionStateChanged {
                session_id,
                old_state: "READY_FOR_VALIDATION".to_string(),
                new_state: "RECLUSTERING".to_string(),
                timestamp: Utc::now(),
            });
            self.event_bus.emit_lossy(DoccatEvent::ReclusteringTriggered {
                session_id,
                reclassification_count,
                round,
                timestamp: Utc::now(),
            });
        }

        Ok(decision)
    }

    async fn apply_document_action_once(
        &self,
        session: &ImportSession,
        document_id: Uuid,
        actor: &str,
        action: &DocumentAction,
    ) -> Result<DocumentDecision> {
        let session_id = session.session_id;
        let now = Utc::now();

        let mut tx = begin_monitored(&self.db, "validation::apply_document_action").await?;
        db::sessions::guard_reviewable_on(tx.conn(), session_id).await?;

        let doc = db::documents::get_document_on(tx.conn(), document_id).await?;
        if !doc.is_canonical {
            return Err(Error::InvalidInput(format!(
                "Document {} is a duplicate of {}; decide on the canonical document",
                document_id,
                doc.duplicate_of.map(|d| d.to_string()).unwrap_or_default()
            )));
        }
        let batch_id = doc.batch_id.ok_or_else(|| {
            Error::InvalidInput(format!("Document {} is not part of a review batch", document_id))
        })?;

        let batch = db::batches::get_batch_on(tx.conn(), batch_id).await?;
        match &batch.assignment {
            Some(assignment) if assignment.user_id != actor => {
                return Err(Error::conflict(
                    BATCH_CONFLICT,
                    format!("Batch {} is assigned to another reviewer", batch_id),
                ));
            }
            Some(_) => {
                db::batches::touch_activity_on(tx.conn(), batch_id, actor, now).await?;
            }
            None => {}
        }

        // Counters move exactly once per outcome change
        let new_outcome = action.outcome();
        let (categorized_delta, skipped_delta) = match (doc.review_outcome, new_outcome) {
            (None, ReviewOutcome::Categorized) => (1, 0),
            (None, ReviewOutcome::Skipped) => (0, 1),
            (Some(ReviewOutcome::Skipped), ReviewOutcome::Categorized) => (1, -1),
            (Some(ReviewOutcome::Categorized), ReviewOutcome::Skipped) => {
                return Err(Error::conflict(
                    CONFLICT,
                    format!("Document {} is already categorized and cannot be skipped", document_id),
                ));
            }
            _ => (0, 0),
        };
        if categorized_delta != 0 || skipped_delta != 0 {
            db::batches::adjust_counters_on(tx.conn(), batch_id, categorized_delta, skipped_delta).await?;
        }

        let mut reclustering_triggered = None;
        match action {
            DocumentAction::Accept => {
                set_decision_on(tx.conn(), document_id, "ACCEPTED", new_outcome, actor, now, false).await?;
            }
            DocumentAction::Delete => {
                set_decision_on(tx.conn(), document_id, "DELETED", new_outcome, actor, now, true).await?;
            }
            DocumentAction::Skip => {
                sqlx::query(
                    "UPDATE documents SET review_outcome = ?, reviewed_by = ?, reviewed_at = ? WHERE id = ?",
                )
                .bind(new_outcome.as_str())
                .bind(actor)
                .bind(to_db(now))
                .bind(document_id.to_string())
                .execute(tx.conn())
                .await?;
            }
            DocumentAction::Reclassify {
                note,
                target_cluster_id,
            } => {
                if let Some(target) = target_cluster_id {
                    let cluster = db::clusters::get_cluster_on(tx.conn(), *target).await?;
                    require_live_in_session(&cluster, session_id)?;
                }

                sqlx::query(
                    r#"
                    UPDATE documents
                    SET validation_status = 'RECLASSIFIED',
                        reclassification_note = ?,
                        reclassification_round = reclassification_round + 1,
                        pending_recluster = ?,
                        cluster_id = COALESCE(?, cluster_id),
                        review_outcome = ?,
                        reviewed_by = ?,
                        reviewed_at = ?,
                        deleted = 0, deleted_by = NULL, deleted_at = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(note.trim())
                .bind(target_cluster_id.is_none())
                .bind(target_cluster_id.map(|t| t.to_string()))
                .bind(new_outcome.as_str())
                .bind(actor)
                .bind(to_db(now))
                .bind(document_id.to_string())
                .execute(tx.conn())
                .await?;

                if let Some(target) = target_cluster_id {
                    db::clusters::recount_on(tx.conn(), *target).await?;
                    if let Some(previous) = doc.cluster_id.filter(|p| p != target) {
                        db::clusters::recount_on(tx.conn(), previous).await?;
                    }
                }

                db::sessions::increment_reclassifications_on(tx.conn(), session_id).await?;

                let total: i64 =
                    sqlx::query_scalar("SELECT total_documents FROM import_sessions WHERE session_id = ?")
                        .bind(session_id.to_string())
                        .fetch_one(tx.conn())
                        .await?;
                if let Some(trigger) = session.parameters.reclassify_threshold.trigger_count(total) {
                    reclustering_triggered =
                        db::sessions::try_trigger_reclustering_on(tx.conn(), session_id, trigger).await?;
                }
            }
        }

        db::audit::record_on(
            tx.conn(),
            session_id,
            actor,
            action.name(),
            "document",
            &document_id.to_string(),
            serde_json::json!({
                "batch_id": batch_id,
                "previous_status": doc.validation_status.as_str(),
                "action": action,
                "reclustering_triggered": reclustering_triggered.is_some(),
            }),
        )
        .await?;

        let document = db::documents::get_document_on(tx.conn(), document_id).await?;
        tx.commit().await?;

        Ok(DocumentDecision {
            document,
            reclustering_triggered,
        })
    }

    /// Approve a cluster, optionally overriding its suggested name
    pub async fn approve_cluster(&self, cluster_id: Uuid, actor: &str, name: Option<String>) -> Result<Cluster> {
        let actor = require_actor(actor)?;
        let name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());

        self.update_cluster(cluster_id, actor, "APPROVE", move |cluster| {
            let approved = name
                .clone()
                .or_else(|| cluster.suggested_name.clone())
                .ok_or_else(|| {
                    Error::InvalidInput(format!("Cluster {} has no suggested name; provide one", cluster.id))
                })?;
            Ok(ClusterChange::Approve(approved))
        })
        .await
    }

    pub async fn reject_cluster(&self, cluster_id: Uuid, actor: &str) -> Result<Cluster> {
        let actor = require_actor(actor)?;
        self.update_cluster(cluster_id, actor, "REJECT", |_| Ok(ClusterChange::Reject))
            .await
    }

    /// Hide a cluster from the review lists (membership is untouched)
    pub async fn soft_delete_cluster(&self, cluster_id: Uuid, actor: &str) -> Result<Cluster> {
        let actor = require_actor(actor)?;
        self.update_cluster(cluster_id, actor, "DELETE", |_| Ok(ClusterChange::SoftDelete))
            .await
    }

    pub async fn restore_cluster(&self, cluster_id: Uuid, actor: &str) -> Result<Cluster> {
        let actor = require_actor(actor)?;
        self.update_cluster(cluster_id, actor, "RESTORE", |_| Ok(ClusterChange::Restore))
            .await
    }

    async fn update_cluster<F>(&self, cluster_id: Uuid, actor: &str, action: &'static str, change: F) -> Result<Cluster>
    where
        F: Fn(&Cluster) -> Result<ClusterChange>,
    {
        let session_id = db::clusters::get_cluster(&self.db, cluster_id).await?.session_id;
        let max_wait_ms = db::settings::get_max_lock_wait_ms(&self.db).await?;

        let cluster = retry_on_lock("cluster decision", max_wait_ms, || async {
            let mut tx = begin_monitored(&self.db, "validation::update_cluster").await?;
            db::sessions::guard_reviewable_on(tx.conn(), session_id).await?;

            let cluster = db::clusters::get_cluster_on(tx.conn(), cluster_id).await?;
            if cluster.merged_into.is_some() {
                return Err(Error::conflict(
                    CONFLICT,
                    format!("Cluster {} was merged away", cluster_id),
                ));
            }

            let now = to_db(Utc::now());
            let query = match change(&cluster)? {
                ClusterChange::Approve(name) => sqlx::query(
                    "UPDATE clusters SET status = 'APPROVED', approved_name = ?, updated_at = ? WHERE id = ?",
                )
                .bind(name)
                .bind(now.clone()),
                ClusterChange::Reject => {
                    sqlx::query("UPDATE clusters SET status = 'REJECTED', updated_at = ? WHERE id = ?")
                        .bind(now.clone())
                }
                ClusterChange::SoftDelete => sqlx::query(
                    r#"
                    UPDATE clusters
                    SET deleted = 1, deleted_by = ?, deleted_at = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(actor.to_string())
                .bind(now.clone())
                .bind(now.clone()),
                ClusterChange::Restore => sqlx::query(
                    "UPDATE clusters SET deleted = 0, deleted_by = NULL, deleted_at = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(now.clone()),
            };
            query.bind(cluster_id.to_string()).execute(tx.conn()).await?;

            db::audit::record_on(
                tx.conn(),
                session_id,
                actor,
                action,
                "cluster",
                &cluster_id.to_string(),
                serde_json::json!({ "previous_status": cluster.status.as_str() }),
            )
            .await?;

            let updated = db::clusters::get_cluster_on(tx.conn(), cluster_id).await?;
            tx.commit().await?;
            Ok(updated)
        })
        .await?;

        tracing::info!(session_id = %session_id, cluster_id = %cluster_id, actor, action, "Cluster decision applied");
        Ok(cluster)
    }

    /// Merge `source_ids` into `target_id`
    ///
    /// All-or-nothing: every source document is repointed at the target, the
    /// sources are emptied and marked merged, and one audit entry records it.
    pub async fn merge_clusters(
        &self,
        session_id: Uuid,
        target_id: Uuid,
        source_ids: &[Uuid],
        actor: &str,
    ) -> Result<MergeResult> {
        let actor = require_actor(actor)?;
        let sources: Vec<Uuid> = source_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if sources.is_empty() {
            return Err(Error::InvalidInput("At least one source cluster is required".to_string()));
        }
        if sources.contains(&target_id) {
            return Err(Error::InvalidInput("A cluster cannot be merged into itself".to_string()));
        }

        let max_wait_ms = db::settings::get_max_lock_wait_ms(&self.db).await?;
        let result = retry_on_lock("merge clusters", max_wait_ms, || {
            self.merge_clusters_once(session_id, target_id, &sources, actor)
        })
        .await?;

        tracing::info!(
            session_id = %session_id,
            target_cluster_id = %target_id,
            sources = sources.len(),
            documents_moved = result.documents_moved,
            actor,
            "Clusters merged"
        );
        self.event_bus.emit_lossy(DoccatEvent::ClustersMerged {
            session_id,
            target_cluster_id: target_id,
            source_cluster_ids: sources,
            documents_moved: result.documents_moved,
            timestamp: Utc::now(),
        });

        Ok(result)
    }

    async fn merge_clusters_once(
        &self,
        session_id: Uuid,
        target_id: Uuid,
        sources: &[Uuid],
        actor: &str,
    ) -> Result<MergeResult> {
        let mut tx = begin_monitored(&self.db, "validation::merge_clusters").await?;
        db::sessions::guard_reviewable_on(tx.conn(), session_id).await?;

        let target = db::clusters::get_cluster_on(tx.conn(), target_id).await?;
        require_live_in_session(&target, session_id)?;
        for source_id in sources {
            let source = db::clusters::get_cluster_on(tx.conn(), *source_id).await?;
            require_live_in_session(&source, session_id)?;
        }

        let now = to_db(Utc::now());
        let mut documents_moved = 0u64;
        for source_id in sources {
            documents_moved += sqlx::query("UPDATE documents SET cluster_id = ? WHERE cluster_id = ?")
                .bind(target_id.to_string())
                .bind(source_id.to_string())
                .execute(tx.conn())
                .await?
                .rows_affected();

            sqlx::query(
                "UPDATE clusters SET document_count = 0, merged_into = ?, updated_at = ? WHERE id = ?",
            )
            .bind(target_id.to_string())
            .bind(&now)
            .bind(source_id.to_string())
            .execute(tx.conn())
            .await?;
        }

        let target_document_count = db::clusters::recount_on(tx.conn(), target_id).await?;

        db::audit::record_on(
            tx.conn(),
            session_id,
            actor,
            "MERGE",
            "cluster",
            &target_id.to_string(),
            serde_json::json!({
                "source_cluster_ids": sources,
                "documents_moved": documents_moved,
                "target_document_count": target_document_count,
            }),
        )
        .await?;

        tx.commit().await?;

        Ok(MergeResult {
            target_cluster_id: target_id,
            source_cluster_ids: sources.to_vec(),
            documents_moved,
            target_document_count,
        })
    }
}

enum ClusterChange {
    Approve(String),
    Reject,
    SoftDelete,
    Restore,
}

fn require_actor(actor: &str) -> Result<&str> {
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(Error::InvalidInput("actor must not be empty".to_string()));
    }
    Ok(actor)
}

fn require_live_in_session(cluster: &Cluster, session_id: Uuid) -> Result<()> {
    if cluster.session_id != session_id {
        return Err(Error::InvalidInput(format!(
            "Cluster {} belongs to another session",
            cluster.id
        )));
    }
    if !cluster.is_live() {
        return Err(Error::InvalidInput(format!(
            "Cluster {} was deleted or merged away",
            cluster.id
        )));
    }
    Ok(())
}

async fn set_decision_on(
    conn: &mut SqliteConnection,
    document_id: Uuid,
    status: &str,
    outcome: ReviewOutcome,
    actor: &str,
    now: chrono::DateTime<Utc>,
    delete: bool,
) -> Result<()> {
    let now = to_db(now);
    sqlx::query(
        r#"
        UPDATE documents
        SET validation_status = ?,
            review_outcome = ?,
            reviewed_by = ?,
            reviewed_at = ?,
            deleted = ?,
            deleted_by = CASE WHEN ? THEN ? ELSE NULL END,
            deleted_at = CASE WHEN ? THEN ? ELSE NULL END
        WHERE id = ?
        "#,
    )
    .bind(status)
    .bind(outcome.as_str())
    .bind(actor)
    .bind(&now)
    .bind(delete)
    .bind(delete)
    .bind(actor)
    .bind(delete)
    .bind(&now)
    .bind(document_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
