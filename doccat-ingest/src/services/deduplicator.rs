//! Duplicate detection over content fingerprints
//!
//! Fingerprints are computed once per document (missing ones only), then
//! every fingerprint group elects its canonical member with
//! [`choose_canonical`]. The group assignments are rewritten in full on every
//! run, so running the stage again over unchanged input changes nothing.

use futures::stream::{self, StreamExt};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use doccat_common::Result;

use super::fingerprint::{choose_canonical, fingerprint_bytes, fingerprint_text, CanonicalCandidate};
use super::storage::{BlobStore, StorageError};
use crate::db;
use crate::models::Document;

/// Outcome of one deduplication run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupReport {
    /// Documents considered
    pub documents: usize,
    /// Fingerprints computed by this run
    pub fingerprinted: usize,
    /// Documents whose content could not be read (not yet persisted)
    pub failures: Vec<(Uuid, String)>,
    /// Fingerprint groups with more than one member
    pub duplicate_groups: usize,
    /// Non-canonical documents after the run
    pub duplicates: usize,
}

pub struct Deduplicator {
    db: SqlitePool,
    storage: Arc<dyn BlobStore>,
}

impl Deduplicator {
    pub fn new(db: SqlitePool, storage: Arc<dyn BlobStore>) -> Self {
        Self { db, storage }
    }

    /// Fingerprint one document: extracted text when present, raw bytes otherwise
    pub async fn fingerprint_document(&self, document: &Document) -> std::result::Result<String, StorageError> {
        match &document.text_path {
            Some(text_path) => {
                let bytes = self.storage.get(text_path).await?;
                Ok(fingerprint_text(&String::from_utf8_lossy(&bytes)))
            }
            None => {
                let bytes = self.storage.get(&document.storage_path).await?;
                Ok(fingerprint_bytes(&bytes))
            }
        }
    }

    /// Compute missing fingerprints and rewrite duplicate groups for a session
    ///
    /// Reads run `concurrency` at a time; once `cancel` fires no new read starts.
    /// Documents that fail to read are reported and left out of grouping.
    pub async fn run(
        &self,
        session_id: Uuid,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<DedupReport> {
        let candidates = db::documents::list_dedup_candidates(&self.db, session_id).await?;
        let mut report = DedupReport {
            documents: candidates.len(),
            ..Default::default()
        };

        let missing: Vec<&Document> = candidates.iter().filter(|d| d.fingerprint.is_none()).collect();
        let mut computed: BTreeMap<Uuid, String> = BTreeMap::new();

        let token = cancel.clone();
        let mut results = stream::iter(missing)
            .take_while(move |_| futures::future::ready(!token.is_cancelled()))
            .map(|doc| async move { (doc.id, self.fingerprint_document(doc).await) })
            .buffer_unordered(concurrency.max(1))
            .boxed();

        while let Some((id, result)) = results.next().await {
            match result {
                Ok(fingerprint) => {
                    db::documents::set_fingerprint(&self.db, id, &fingerprint).await?;
                    computed.insert(id, fingerprint);
                    report.fingerprinted += 1;
                }
                Err(e) => {
                    tracing::warn!(document_id = %id, error = %e, "Could not read document content");
                    report.failures.push((id, e.to_string()));
                }
            }
        }

        if cancel.is_cancelled() {
            tracing::info!(session_id = %session_id, "Deduplication cancelled before grouping");
            return Ok(report);
        }

        // Group by fingerprint; BTreeMap keeps the write order stable
        let mut groups: BTreeMap<String, Vec<CanonicalCandidate>> = BTreeMap::new();
        for doc in &candidates {
            let fingerprint = doc.fingerprint.clone().or_else(|| computed.get(&doc.id).cloned());
            if let Some(fingerprint) = fingerprint {
                groups.entry(fingerprint).or_default().push(CanonicalCandidate {
                    id: doc.id,
                    fidelity: doc.fidelity,
                    extracted_at: doc.extracted_at,
                });
            }
        }

        let mut assignments = Vec::new();
        for members in groups.values() {
            let Some(canonical) = choose_canonical(members) else {
                continue;
            };
            if members.len() > 1 {
                report.duplicate_groups += 1;
            }
            for member in members {
                if member.id == canonical {
                    assignments.push((member.id, None));
                } else {
                    assignments.push((member.id, Some(canonical)));
                    report.duplicates += 1;
                }
            }
        }

        db::documents::apply_duplicate_groups(&self.db, &assignments).await?;

        tracing::info!(
            session_id = %session_id,
            documents = report.documents,
            fingerprinted = report.fingerprinted,
            duplicate_groups = report.duplicate_groups,
            duplicates = report.duplicates,
            failures = report.failures.len(),
            "Deduplication complete"
        );

        Ok(report)
    }
}
