//! EMBEDDING: fixed-dimension vector per canonical, non-irrelevant document

use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use doccat_common::Result;

use super::statistics::StageCounters;
use super::{DocumentResult, PipelineOrchestrator, StageOutcome};
use crate::db;
use crate::models::{Document, ImportSession, PipelineParameters, Stage};
use crate::services::scoring::{with_retry, ScoringClient, ScoringError};
use crate::services::storage::BlobStore;

/// Embedding length shared by every document of a session
///
/// Fixed by the scoring client when it knows it, otherwise by the first
/// vector seen (stored or freshly computed).
#[derive(Debug, Default)]
struct Dimension(Mutex<Option<usize>>);

impl Dimension {
    /// Accept `len` if it matches (or establishes) the session dimension
    fn check(&self, len: usize) -> std::result::Result<(), ScoringError> {
        let mut fixed = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match *fixed {
            Some(expected) if expected != len => Err(ScoringError::DimensionMismatch { expected, actual: len }),
            Some(_) => Ok(()),
            None => {
                *fixed = Some(len);
                Ok(())
            }
        }
    }

    fn get(&self) -> Option<usize> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PipelineOrchestrator {
    pub(super) async fn phase_embedding(
        &self,
        session: &ImportSession,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let session_id = session.session_id;
        let candidates = db::documents::list_embedding_candidates(&self.db, session_id).await?;

        // Unknown up front: vectors kept from an earlier run fix it
        let known = self.scoring.dimension().or_else(|| {
            candidates
                .iter()
                .find_map(|d| d.embedding.as_ref().map(Vec::len))
        });
        let dimension = Arc::new(Dimension(Mutex::new(known)));

        let (done, pending): (Vec<Document>, Vec<Document>) =
            candidates.into_iter().partition(|d| d.embedding.is_some());

        let counters = StageCounters::new(done.len() + pending.len());
        counters.record_skipped(done.len());

        tracing::info!(
            session_id = %session_id,
            pending = pending.len(),
            already_done = done.len(),
            dimension = ?dimension.get(),
            "Phase EMBED"
        );

        let run = self
            .process_documents(session, Stage::Embed, pending, &counters, cancel, |doc| {
                embed_document(
                    self.db.clone(),
                    self.scoring.clone(),
                    self.storage.clone(),
                    session.parameters.clone(),
                    dimension.clone(),
                    doc,
                )
            })
            .await?;

        tracing::info!(session_id = %session_id, "{}", counters.display_string("embedded"));
        let details = serde_json::json!({ "dimension": dimension.get() });
        self.conclude(Stage::Embed, &counters, run, details).await
    }
}

async fn embed_document(
    db: SqlitePool,
    scoring: Arc<dyn ScoringClient>,
    storage: Arc<dyn BlobStore>,
    params: PipelineParameters,
    dimension: Arc<Dimension>,
    doc: Document,
) -> DocumentResult {
    let text = match PipelineOrchestrator::document_text(&storage, &doc).await {
        Ok(text) => text,
        Err(e) => return Ok(Err(e)),
    };

    let vector = with_retry(
        "embed",
        params.scoring_max_attempts,
        params.scoring_backoff_ms,
        || {
            let scoring = scoring.clone();
            let text = text.clone();
            async move { scoring.embed(&text).await }
        },
    )
    .await;

    let vector = match vector {
        Ok(vector) if vector.is_empty() => {
            return Ok(Err(ScoringError::InvalidResponse("empty embedding".to_string()).to_string()))
        }
        Ok(vector) => vector,
        Err(e) => return Ok(Err(e.to_string())),
    };

    if let Err(e) = dimension.check(vector.len()) {
        return Ok(Err(e.to_string()));
    }

    db::documents::store_embedding(&db, doc.id, &vector).await?;
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_dimension_rejects_other_lengths() {
        let dimension = Dimension(Mutex::new(Some(3)));
        assert!(dimension.check(3).is_ok());
        assert!(matches!(
            dimension.check(4),
            Err(ScoringError::DimensionMismatch { expected: 3, actual: 4 })
        ));
    }

    #[test]
    fn test_first_vector_fixes_unknown_dimension() {
        let dimension = Dimension::default();
        assert_eq!(dimension.get(), None);
        dimension.check(8).unwrap();
        assert_eq!(dimension.get(), Some(8));
        assert!(dimension.check(5).is_err());
    }
}
