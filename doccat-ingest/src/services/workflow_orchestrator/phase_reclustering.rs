//! RECLUSTERING: release reclassified documents and rejected clusters' members

use tokio_util::sync::CancellationToken;

use doccat_common::Result;

use super::{PipelineOrchestrator, StageOutcome};
use crate::db;
use crate::db::stage_stats::StageSummary;
use crate::models::ImportSession;

impl PipelineOrchestrator {
    pub(super) async fn phase_reclustering(
        &self,
        session: &ImportSession,
        _cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let detached = db::clusters::detach_for_reclustering(&self.db, session.session_id).await?;

        tracing::info!(
            session_id = %session.session_id,
            round = session.reclustering_rounds,
            detached,
            "Phase RE_CLUSTER"
        );

        Ok(StageOutcome::Completed(StageSummary {
            documents_in: detached as i64,
            documents_out: detached as i64,
            details: serde_json::json!({
                "round": session.reclustering_rounds,
                "reclassifications": session.reclassification_count,
            }),
            ..Default::default()
        }))
    }
}
