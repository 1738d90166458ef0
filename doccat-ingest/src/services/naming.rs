//! Cluster naming with a membership-keyed cache
//!
//! A name is produced for a membership, not for a cluster id: the cache is
//! keyed by (session, membership hash), so a cluster whose members did not
//! change keeps its name across reclustering rounds and repeated runs, and
//! the scoring collaborator is only asked on a cache miss.

use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

use super::clustering::membership_hash;
use super::scoring::{with_retry, ScoringClient, ScoringError};
use super::storage::{BlobStore, StorageError};
use crate::db;
use crate::db::clusters::CachedName;
use crate::models::{Cluster, Document};

#[derive(Debug, Error)]
pub enum NamingError {
    #[error(transparent)]
    Database(#[from] doccat_common::Error),

    #[error("Naming failed: {0}")]
    Scoring(#[from] ScoringError),

    #[error("Sample text unavailable: {0}")]
    Storage(#[from] StorageError),
}

/// How a cluster got its current name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingOutcome {
    /// Membership unchanged since the last naming
    Unchanged,
    /// Reused the name cached for this membership
    Cached,
    /// Asked the scoring collaborator
    Generated,
}

pub struct ClusterNamer {
    db: SqlitePool,
    scoring: Arc<dyn ScoringClient>,
    storage: Arc<dyn BlobStore>,
    sample_size: usize,
    max_attempts: u32,
    backoff_ms: u64,
}

impl ClusterNamer {
    pub fn new(
        db: SqlitePool,
        scoring: Arc<dyn ScoringClient>,
        storage: Arc<dyn BlobStore>,
        sample_size: usize,
        max_attempts: u32,
        backoff_ms: u64,
    ) -> Self {
        Self {
            db,
            scoring,
            storage,
            sample_size,
            max_attempts,
            backoff_ms,
        }
    }

    /// Ensure `cluster` carries a name for its current membership
    pub async fn name_cluster(&self, cluster: &Cluster) -> Result<NamingOutcome, NamingError> {
        let members = db::documents::list_cluster_members(&self.db, cluster.id).await?;
        let member_ids: Vec<_> = members.iter().map(|d| d.id).collect();
        let hash = membership_hash(&member_ids);
        let samples: Vec<&Document> = members.iter().take(self.sample_size).collect();
        let sample_ids: Vec<_> = samples.iter().map(|d| d.id).collect();

        if cluster.membership_hash.as_deref() == Some(hash.as_str()) && cluster.suggested_name.is_some() {
            return Ok(NamingOutcome::Unchanged);
        }

        if let Some(cached) = db::clusters::cached_name(&self.db, cluster.session_id, &hash).await? {
            db::clusters::set_naming(&self.db, cluster.id, &cached, &hash, &sample_ids).await?;
            tracing::debug!(cluster_id = %cluster.id, name = %cached.name, "Cluster name reused from cache");
            return Ok(NamingOutcome::Cached);
        }

        let mut texts = Vec::with_capacity(samples.len());
        for doc in &samples {
            texts.push(self.sample_text(doc).await?);
        }

        let scoring = self.scoring.clone();
        let naming = with_retry("name", self.max_attempts, self.backoff_ms, || {
            let scoring = scoring.clone();
            let texts = texts.clone();
            async move { scoring.name(&texts).await }
        })
        .await?;

        if naming.name.trim().is_empty() {
            return Err(ScoringError::InvalidResponse("empty cluster name".to_string()).into());
        }

        let proposed = CachedName {
            name: naming.name,
            name_translation: naming.name_translation,
            description: naming.description,
        };
        db::clusters::store_cached_name(&self.db, cluster.session_id, &hash, &proposed).await?;

        // A concurrent namer may have stored first; use whatever the cache holds
        let stored = db::clusters::cached_name(&self.db, cluster.session_id, &hash)
            .await?
            .unwrap_or(proposed);
        db::clusters::set_naming(&self.db, cluster.id, &stored, &hash, &sample_ids).await?;

        tracing::info!(
            cluster_id = %cluster.id,
            members = member_ids.len(),
            name = %stored.name,
            "Cluster named"
        );
        Ok(NamingOutcome::Generated)
    }

    async fn sample_text(&self, doc: &Document) -> Result<String, StorageError> {
        match &doc.text_path {
            Some(path) => {
                let bytes = self.storage.get(path).await?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            None => Ok(format!("[image attachment: {}]", doc.file_name)),
        }
    }
}
