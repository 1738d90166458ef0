//! NAMING: propose a name for every cluster whose membership has no name yet

use tokio_util::sync::CancellationToken;

use doccat_common::Result;

use super::statistics::StageCounters;
use super::{PipelineOrchestrator, StageOutcome};
use crate::db;
use crate::models::ImportSession;
use crate::services::naming::{ClusterNamer, NamingError, NamingOutcome};

impl PipelineOrchestrator {
    pub(super) async fn phase_naming(
        &self,
        session: &ImportSession,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let session_id = session.session_id;
        let params = &session.parameters;
        let clusters = db::clusters::list_nameable(&self.db, session_id).await?;

        tracing::info!(session_id = %session_id, clusters = clusters.len(), "Phase NAME");

        let namer = ClusterNamer::new(
            self.db.clone(),
            self.scoring.clone(),
            self.storage.clone(),
            params.sample_size,
            params.scoring_max_attempts,
            params.scoring_backoff_ms,
        );

        let counters = StageCounters::new(clusters.len());
        let mut unnamed = 0usize;
        let mut streak_exceeded = false;
        let mut cancelled = false;
        let (mut generated, mut cached) = (0usize, 0usize);

        // Sequential: clusters are few and naming calls are the expensive ones
        for cluster in &clusters {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match namer.name_cluster(cluster).await {
                Ok(NamingOutcome::Unchanged) => counters.record_skipped(1),
                Ok(NamingOutcome::Cached) => {
                    cached += 1;
                    counters.record_success();
                }
                Ok(NamingOutcome::Generated) => {
                    generated += 1;
                    counters.record_success();
                }
                Err(NamingError::Database(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!(cluster_id = %cluster.id, error = %e, "Cluster left unnamed");
                    unnamed += 1;
                    if counters.record_failure(&e.to_string()) >= params.max_consecutive_failures.max(1) {
                        streak_exceeded = true;
                        break;
                    }
                }
            }
        }

        let summary = counters.summary(serde_json::json!({
            "clusters": clusters.len(),
            "generated": generated,
            "from_cache": cached,
            "unnamed": unnamed,
        }));

        if cancelled {
            return Ok(StageOutcome::Cancelled(summary));
        }
        if streak_exceeded || counters.all_failed() {
            return Ok(StageOutcome::Fatal {
                error: format!(
                    "Naming failed for {} clusters; last error: {}",
                    unnamed,
                    counters.last_error().unwrap_or_default()
                ),
                summary,
            });
        }

        // Unnamed clusters are still reviewable; reviewers name them on approval
        tracing::info!(session_id = %session_id, generated, cached, unnamed, "Naming complete");
        Ok(StageOutcome::Completed(summary))
    }
}
