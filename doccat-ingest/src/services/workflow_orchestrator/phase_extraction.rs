//! EXTRACTING: write the export manifest of approved clusters
//!
//! The manifest lists every approved, live cluster with its canonical
//! documents that were not deleted and are not waiting to be regrouped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use doccat_common::{Error, Result};

use super::{PipelineOrchestrator, StageOutcome};
use crate::db;
use crate::db::stage_stats::StageSummary;
use crate::models::{ClusterStatus, ImportSession, ValidationStatus};

/// Blob path of a session's export manifest
pub fn export_manifest_path(session_id: Uuid) -> String {
    format!("sessions/{}/export/manifest.json", session_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub session_id: Uuid,
    pub firm_id: String,
    pub source_file_name: String,
    pub generated_at: DateTime<Utc>,
    pub categories: Vec<ExportedCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedCategory {
    pub cluster_id: Uuid,
    pub name: String,
    pub name_translation: Option<String>,
    pub description: Option<String>,
    pub documents: Vec<ExportedDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedDocument {
    pub document_id: Uuid,
    pub file_name: String,
    pub storage_path: String,
    pub validation_status: ValidationStatus,
}

impl PipelineOrchestrator {
    pub(super) async fn phase_extraction(
        &self,
        session: &ImportSession,
        _cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let session_id = session.session_id;
        let clusters = db::clusters::list_for_session(&self.db, session_id, false).await?;

        let mut categories = Vec::new();
        let mut exported = 0usize;
        for cluster in clusters.iter().filter(|c| c.status == ClusterStatus::Approved) {
            let members = db::documents::list_cluster_members(&self.db, cluster.id).await?;
            let documents: Vec<ExportedDocument> = members
                .into_iter()
                .filter(|d| {
                    d.is_canonical
                        && !d.deleted
                        && !d.pending_recluster
                        && d.validation_status != ValidationStatus::Deleted
                })
                .map(|d| ExportedDocument {
                    document_id: d.id,
                    file_name: d.file_name,
                    storage_path: d.storage_path,
                    validation_status: d.validation_status,
                })
                .collect();
            exported += documents.len();

            categories.push(ExportedCategory {
                cluster_id: cluster.id,
                name: cluster.display_name().unwrap_or("Unnamed category").to_string(),
                name_translation: cluster.name_translation.clone(),
                description: cluster.description.clone(),
                documents,
            });
        }

        let manifest = ExportManifest {
            session_id,
            firm_id: session.firm_id.clone(),
            source_file_name: session.source_file_name.clone(),
            generated_at: Utc::now(),
            categories,
        };
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Internal(format!("Failed to serialize export manifest: {}", e)))?;

        let summary = StageSummary {
            documents_in: exported as i64,
            documents_out: exported as i64,
            details: serde_json::json!({
                "categories": manifest.categories.len(),
                "manifest_path": export_manifest_path(session_id),
            }),
            ..Default::default()
        };

        match self.storage.put(&export_manifest_path(session_id), bytes).await {
            Ok(path) => {
                tracing::info!(
                    session_id = %session_id,
                    categories = manifest.categories.len(),
                    documents = exported,
                    path = %path,
                    "Export manifest written"
                );
                Ok(StageOutcome::Completed(summary))
            }
            Err(e) => Ok(StageOutcome::Fatal {
                error: format!("Failed to write export manifest: {}", e),
                summary: StageSummary {
                    error_count: 1,
                    last_error: Some(e.to_string()),
                    ..summary
                },
            }),
        }
    }
}
