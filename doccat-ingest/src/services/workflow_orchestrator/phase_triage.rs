//! TRIAGING: relevance verdict per document

use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use doccat_common::Result;

use super::statistics::StageCounters;
use super::{DocumentResult, PipelineOrchestrator, StageOutcome};
use crate::db;
use crate::models::{Document, ImportSession, PipelineParameters, Stage, TriageLabel};
use crate::services::scoring::{with_retry, ScoringClient};
use crate::services::storage::BlobStore;

impl PipelineOrchestrator {
    pub(super) async fn phase_triage(
        &self,
        session: &ImportSession,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let session_id = session.session_id;

        let pending = db::documents::list_pending_triage(&self.db, session_id).await?;
        let all = db::documents::list_for_session(&self.db, session_id).await?;
        let already_done = all
            .iter()
            .filter(|d| !d.deleted && d.triage_label.is_some() && d.stage_error.is_none())
            .count();

        let counters = StageCounters::new(pending.len() + already_done);
        counters.record_skipped(already_done);

        tracing::info!(
            session_id = %session_id,
            pending = pending.len(),
            already_done,
            "Phase TRIAGE"
        );

        let run = self
            .process_documents(session, Stage::Triage, pending, &counters, cancel, |doc| {
                triage_document(
                    self.db.clone(),
                    self.scoring.clone(),
                    self.storage.clone(),
                    session.parameters.clone(),
                    doc,
                )
            })
            .await?;

        tracing::info!(session_id = %session_id, "{}", counters.display_string("triaged"));
        self.conclude(Stage::Triage, &counters, run, serde_json::json!({})).await
    }
}

async fn triage_document(
    db: SqlitePool,
    scoring: Arc<dyn ScoringClient>,
    storage: Arc<dyn BlobStore>,
    params: PipelineParameters,
    doc: Document,
) -> DocumentResult {
    let text = match PipelineOrchestrator::document_text(&storage, &doc).await {
        Ok(text) => text,
        Err(e) => return Ok(Err(e)),
    };

    let verdict = with_retry(
        "triage",
        params.scoring_max_attempts,
        params.scoring_backoff_ms,
        || {
            let scoring = scoring.clone();
            let text = text.clone();
            async move { scoring.triage(&text).await }
        },
    )
    .await;

    let verdict = match verdict {
        Ok(verdict) => verdict,
        Err(e) => return Ok(Err(e.to_string())),
    };

    // Low-confidence verdicts go to a human
    let label = match params.triage_min_confidence {
        Some(min) if verdict.confidence < min => TriageLabel::Uncertain,
        _ => verdict.label,
    };

    db::documents::record_triage(&db, doc.id, label, verdict.confidence, verdict.reason.as_deref()).await?;
    tracing::debug!(document_id = %doc.id, label = label.as_str(), "Document triaged");
    Ok(Ok(()))
}
