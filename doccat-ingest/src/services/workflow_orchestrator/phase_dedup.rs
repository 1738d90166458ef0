//! DEDUPLICATING: fingerprints and duplicate groups

use tokio_util::sync::CancellationToken;

use doccat_common::Result;

use super::statistics::StageCounters;
use super::{DocumentRun, PipelineOrchestrator, StageOutcome};
use crate::models::{ImportSession, Stage};
use crate::services::deduplicator::Deduplicator;

impl PipelineOrchestrator {
    pub(super) async fn phase_dedup(
        &self,
        session: &ImportSession,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        tracing::info!(session_id = %session.session_id, "Phase DEDUPLICATE");

        let deduplicator = Deduplicator::new(self.db.clone(), self.storage.clone());
        let report = deduplicator
            .run(session.session_id, session.parameters.max_concurrent_requests, cancel)
            .await?;

        let counters = StageCounters::new(report.documents);
        counters.record_skipped(
            report
                .documents
                .saturating_sub(report.fingerprinted + report.failures.len()),
        );
        for _ in 0..report.fingerprinted {
            counters.record_success();
        }
        for (_, error) in &report.failures {
            counters.record_failure(error);
        }

        let details = serde_json::json!({
            "duplicate_groups": report.duplicate_groups,
            "duplicates": report.duplicates,
            "canonical": report
                .documents
                .saturating_sub(report.failures.len() + report.duplicates),
        });

        let run = DocumentRun {
            failures: report.failures,
            streak_exceeded: false,
            cancelled: cancel.is_cancelled(),
        };
        self.conclude(Stage::Deduplicate, &counters, run, details).await
    }
}
