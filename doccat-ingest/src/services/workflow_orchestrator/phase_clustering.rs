//! CLUSTERING: group unclustered embedded documents
//!
//! Only documents without a cluster take part, so a reclustering round
//! regroups exactly what RECLUSTERING released and leaves reviewed clusters
//! alone.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use doccat_common::Result;

use super::{PipelineOrchestrator, StageOutcome};
use crate::db;
use crate::db::stage_stats::StageSummary;
use crate::models::ImportSession;
use crate::services::clustering::cluster_vectors;

impl PipelineOrchestrator {
    pub(super) async fn phase_clustering(
        &self,
        session: &ImportSession,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let session_id = session.session_id;
        let policy = session.parameters.clustering_policy()?;

        let documents = db::documents::list_unclustered(&self.db, session_id).await?;
        let items: Vec<(Uuid, Vec<f32>)> = documents
            .into_iter()
            .filter_map(|d| d.embedding.map(|v| (d.id, v)))
            .collect();

        tracing::info!(
            session_id = %session_id,
            documents = items.len(),
            similarity_threshold = policy.similarity_threshold,
            min_cluster_size = policy.min_cluster_size,
            round = session.reclustering_rounds,
            "Phase CLUSTER"
        );

        let plan = cluster_vectors(&items, &policy);

        let mut clusters_created = 0usize;
        let mut clustered = 0usize;
        for members in &plan.groups {
            if cancel.is_cancelled() {
                break;
            }
            let samples: Vec<Uuid> = members.iter().take(session.parameters.sample_size).copied().collect();
            let cluster = db::clusters::create_cluster(
                &self.db,
                session_id,
                members,
                &samples,
                session.reclustering_rounds,
            )
            .await?;
            tracing::debug!(cluster_id = %cluster.id, members = members.len(), "Cluster created");
            clusters_created += 1;
            clustered += cluster.document_count as usize;
        }

        let summary = StageSummary {
            documents_in: items.len() as i64,
            documents_out: clustered as i64,
            details: serde_json::json!({
                "clusters_created": clusters_created,
                "uncertain": plan.uncertain.len(),
                "round": session.reclustering_rounds,
            }),
            ..Default::default()
        };

        if cancel.is_cancelled() {
            return Ok(StageOutcome::Cancelled(summary));
        }

        tracing::info!(
            session_id = %session_id,
            clusters_created,
            clustered,
            uncertain = plan.uncertain.len(),
            "Clustering complete"
        );
        Ok(StageOutcome::Completed(summary))
    }
}
