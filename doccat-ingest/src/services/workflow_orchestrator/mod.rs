//! Pipeline orchestrator
//!
//! Drives a session through its automatic stages:
//!
//! NOT_STARTED → TRIAGING → DEDUPLICATING → EMBEDDING → CLUSTERING → NAMING
//! → READY_FOR_VALIDATION → (RECLUSTERING → CLUSTERING → …) → EXTRACTING → COMPLETED
//!
//! # Architecture
//! Each automatic state is handled by a dedicated `phase_*` module. The
//! driver loop reads the session, runs the stage belonging to its state and,
//! on success, moves the session on with a compare-and-set transition. A
//! transition that loses its race (an operator failed the session, another
//! driver got there first) stops the loop quietly: whoever changed the state
//! owns what happens next.
//!
//! Per-document work inside a stage is resumable (documents that already
//! carry a result are skipped), runs with bounded concurrency and records
//! failures per document. A stage only fails as a whole when every attempted
//! document failed or the failure streak reaches `max_consecutive_failures`.

use futures::future;
use futures::stream::{self, StreamExt};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use doccat_common::events::{DoccatEvent, EventBus};
use doccat_common::{Error, Result};

use crate::db;
use crate::db::stage_stats::StageSummary;
use crate::models::{Document, ImportSession, PipelineState, Stage};
use crate::services::scoring::ScoringClient;
use crate::services::storage::BlobStore;
use crate::utils::{begin_monitored, retry_on_lock};

mod phase_clustering;
mod phase_dedup;
mod phase_embedding;
mod phase_extraction;
mod phase_naming;
mod phase_reclustering;
mod phase_triage;
pub mod statistics;

pub use phase_extraction::{export_manifest_path, ExportManifest};
use statistics::StageCounters;

/// How a stage run ended
#[derive(Debug)]
pub(crate) enum StageOutcome {
    Completed(StageSummary),
    /// Stage-wide failure; the session moves to FAILED
    Fatal { summary: StageSummary, error: String },
    /// Operator cancelled the session while the stage ran
    Cancelled(StageSummary),
}

/// Per-document result: `Ok(Err(message))` is a document failure, `Err` aborts the stage
pub(crate) type DocumentResult = Result<std::result::Result<(), String>>;

/// Result of fanning per-document work out over a stage's inputs
#[derive(Debug, Default)]
pub(crate) struct DocumentRun {
    /// Per-document failures, not yet persisted
    pub failures: Vec<(Uuid, String)>,
    /// Dispatch stopped because the failure streak hit the limit
    pub streak_exceeded: bool,
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    scoring: Arc<dyn ScoringClient>,
    storage: Arc<dyn BlobStore>,
    /// Cancellation token of every session with a live driver
    running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    /// Most recent stage or driver failure, reported by `/health`
    last_error: Arc<RwLock<Option<String>>>,
}

impl PipelineOrchestrator {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        scoring: Arc<dyn ScoringClient>,
        storage: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            db,
            event_bus,
            scoring,
            storage,
            running: Arc::new(RwLock::new(HashMap::new())),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn storage(&self) -> Arc<dyn BlobStore> {
        self.storage.clone()
    }

    /// Sessions with a live driver
    pub async fn running_sessions(&self) -> Vec<Uuid> {
        self.running.read().await.keys().copied().collect()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    async fn record_error(&self, session_id: Uuid, error: &str) {
        *self.last_error.write().await = Some(format!("session {}: {}", session_id, error));
    }

    /// NOT_STARTED → TRIAGING
    pub async fn claim_start(&self, session_id: Uuid) -> Result<()> {
        self.transition(session_id, PipelineState::NotStarted, PipelineState::Triaging, None)
            .await
    }

    /// Claim the session and run its pipeline in the background
    pub async fn start(&self, session_id: Uuid) -> Result<()> {
        self.claim_start(session_id).await?;
        self.spawn_driver(session_id);
        Ok(())
    }

    /// FAILED → running state of the stage that failed
    pub async fn claim_resume(&self, session_id: Uuid) -> Result<PipelineState> {
        let resumed = db::sessions::resume_failed(&self.db, session_id).await?;
        self.emit_state_change(session_id, PipelineState::Failed, resumed);
        Ok(resumed)
    }

    pub async fn resume(&self, session_id: Uuid) -> Result<PipelineState> {
        let resumed = self.claim_resume(session_id).await?;
        self.spawn_driver(session_id);
        Ok(resumed)
    }

    /// READY_FOR_VALIDATION → EXTRACTING
    pub async fn claim_extraction(&self, session_id: Uuid) -> Result<()> {
        self.transition(
            session_id,
            PipelineState::ReadyForValidation,
            PipelineState::Extracting,
            None,
        )
        .await
    }

    pub async fn begin_extraction(&self, session_id: Uuid) -> Result<()> {
        self.claim_extraction(session_id).await?;
        self.spawn_driver(session_id);
        Ok(())
    }

    /// Drive a session that already entered RECLUSTERING back to READY_FOR_VALIDATION
    pub fn spawn_reclustering(&self, session_id: Uuid) {
        self.spawn_driver(session_id);
    }

    /// Operator cancellation: move the session to FAILED and stop its driver
    ///
    /// In-flight per-document work finishes and writes its result; nothing
    /// new is dispatched.
    pub async fn fail(&self, session_id: Uuid, reason: &str) -> Result<()> {
        let mut attempts = 0;
        let from = loop {
            attempts += 1;
            let session = db::sessions::get_session(&self.db, session_id).await?;
            let stage = failed_stage_for(&session);

            match db::sessions::mark_failed(&self.db, session_id, session.state, stage, reason).await {
                Ok(()) => break session.state,
                // State moved on between the read and the update
                Err(Error::Conflict { .. })
                    if attempts < 3 && session.state.can_transition_to(PipelineState::Failed) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(token) = self.running.read().await.get(&session_id) {
            token.cancel();
        }

        self.emit_state_change(session_id, from, PipelineState::Failed);
        self.event_bus.emit_lossy(DoccatEvent::SessionFailed {
            session_id,
            stage: from.running_stage().map(|s| s.as_str().to_string()),
            error: reason.to_string(),
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    fn spawn_driver(&self, session_id: Uuid) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.drive(session_id).await {
                tracing::error!(session_id = %session_id, error = %e, "Pipeline driver stopped with error");
                orchestrator.record_error(session_id, &e.to_string()).await;
            }
        });
    }

    /// Run stages until the session reaches a state without automatic work
    ///
    /// Returns the state the driver left the session in. A second driver for
    /// the same session returns immediately.
    pub async fn drive(&self, session_id: Uuid) -> Result<PipelineState> {
        let token = CancellationToken::new();
        {
            let mut running = self.running.write().await;
            if running.contains_key(&session_id) {
                tracing::debug!(session_id = %session_id, "Driver already running");
                drop(running);
                return Ok(db::sessions::get_session(&self.db, session_id).await?.state);
            }
            running.insert(session_id, token.clone());
        }

        let result = self.drive_loop(session_id, &token).await;
        self.running.write().await.remove(&session_id);
        result
    }

    async fn drive_loop(&self, session_id: Uuid, token: &CancellationToken) -> Result<PipelineState> {
        loop {
            let session = db::sessions::get_session(&self.db, session_id).await?;
            let Some(stage) = session.state.running_stage() else {
                return Ok(session.state);
            };
            if token.is_cancelled() {
                return Ok(session.state);
            }

            tracing::info!(session_id = %session_id, stage = %stage, "Stage started");
            let started = Instant::now();
            db::stage_stats::begin(&self.db, session_id, stage).await?;

            let outcome = match self.run_stage(stage, &session, token).await {
                Ok(outcome) => outcome,
                Err(e) => StageOutcome::Fatal {
                    summary: StageSummary {
                        error_count: 1,
                        last_error: Some(e.to_string()),
                        ..Default::default()
                    },
                    error: e.to_string(),
                },
            };

            match outcome {
                StageOutcome::Completed(summary) => {
                    db::stage_stats::finish(&self.db, session_id, stage, &summary).await?;
                    self.event_bus.emit_lossy(DoccatEvent::StageCompleted {
                        session_id,
                        stage: stage.as_str().to_string(),
                        documents_in: summary.documents_in as usize,
                        documents_out: summary.documents_out as usize,
                        failed_documents: summary.failed_documents as usize,
                        duration_ms: started.elapsed().as_millis() as u64,
                        timestamp: chrono::Utc::now(),
                    });

                    let Some(next) = session.state.next_automatic() else {
                        return Ok(session.state);
                    };
                    match self.advance(&session, next, stage).await {
                        Ok(()) => {}
                        Err(Error::Conflict { message, .. }) => {
                            tracing::info!(session_id = %session_id, %message, "Driver stopped, session changed state");
                            return Ok(db::sessions::get_session(&self.db, session_id).await?.state);
                        }
                        Err(e) => return Err(e),
                    }
                }
                StageOutcome::Cancelled(summary) => {
                    let summary = StageSummary {
                        last_error: Some("Cancelled by operator".to_string()),
                        ..summary
                    };
                    db::stage_stats::fail(&self.db, session_id, stage, &summary).await?;
                    tracing::info!(session_id = %session_id, stage = %stage, "Stage cancelled");
                    return Ok(db::sessions::get_session(&self.db, session_id).await?.state);
                }
                StageOutcome::Fatal { summary, error } => {
                    db::stage_stats::fail(&self.db, session_id, stage, &summary).await?;
                    tracing::error!(session_id = %session_id, stage = %stage, error = %error, "Stage failed");
                    self.record_error(session_id, &error).await;

                    match db::sessions::mark_failed(&self.db, session_id, session.state, Some(stage), &error).await {
                        Ok(()) => {
                            self.emit_state_change(session_id, session.state, PipelineState::Failed);
                            self.event_bus.emit_lossy(DoccatEvent::SessionFailed {
                                session_id,
                                stage: Some(stage.as_str().to_string()),
                                error,
                                timestamp: chrono::Utc::now(),
                            });
                            return Ok(PipelineState::Failed);
                        }
                        Err(Error::Conflict { .. }) => {
                            return Ok(db::sessions::get_session(&self.db, session_id).await?.state);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        session: &ImportSession,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        match stage {
            Stage::Triage => self.phase_triage(session, token).await,
            Stage::Deduplicate => self.phase_dedup(session, token).await,
            Stage::Embed => self.phase_embedding(session, token).await,
            Stage::Cluster => self.phase_clustering(session, token).await,
            Stage::Name => self.phase_naming(session, token).await,
            Stage::ReCluster => self.phase_reclustering(session, token).await,
            Stage::Extract => self.phase_extraction(session, token).await,
        }
    }

    /// Move on after `stage` succeeded
    ///
    /// Entering READY_FOR_VALIDATION creates the review batches in the same
    /// transaction as the transition, so reviewers never see the state
    /// without its batches.
    async fn advance(&self, session: &ImportSession, next: PipelineState, stage: Stage) -> Result<()> {
        let session_id = session.session_id;

        if next == PipelineState::ReadyForValidation {
            let batch_size = session.parameters.batch_size;
            let max_wait_ms = db::settings::get_max_lock_wait_ms(&self.db).await?;
            retry_on_lock("enter review", max_wait_ms, || async {
                let mut tx = begin_monitored(&self.db, "orchestrator::enter_review").await?;
                db::sessions::compare_and_set_state_on(
                    tx.conn(),
                    session_id,
                    session.state,
                    next,
                    Some(stage),
                )
                .await?;
                db::batches::create_batches_on(tx.conn(), session_id, batch_size).await?;
                tx.commit().await
            })
            .await?;
            self.emit_state_change(session_id, session.state, next);
            return Ok(());
        }

        self.transition(session_id, session.state, next, Some(stage)).await
    }

    async fn transition(
        &self,
        session_id: Uuid,
        from: PipelineState,
        to: PipelineState,
        checkpoint: Option<Stage>,
    ) -> Result<()> {
        db::sessions::compare_and_set_state(&self.db, session_id, from, to, checkpoint).await?;
        self.emit_state_change(session_id, from, to);
        Ok(())
    }

    fn emit_state_change(&self, session_id: Uuid, from: PipelineState, to: PipelineState) {
        self.event_bus.emit_lossy(DoccatEvent::SessionStateChanged {
            session_id,
            old_state: from.as_str().to_string(),
            new_state: to.as_str().to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Fan `work` out over `documents`, `max_concurrent_requests` at a time
    ///
    /// `work` resolves to `Ok(Err(message))` for a per-document failure and
    /// to `Err` for a database error, which aborts the stage. Dispatch stops
    /// when `cancel` fires or the failure streak reaches the limit; work
    /// already in flight is still awaited.
    pub(crate) async fn process_documents<F, Fut>(
        &self,
        session: &ImportSession,
        stage: Stage,
        documents: Vec<Document>,
        counters: &StageCounters,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<DocumentRun>
    where
        F: Fn(Document) -> Fut,
        Fut: Future<Output = DocumentResult>,
    {
        let params = &session.parameters;
        let stop = cancel.child_token();
        let gate = stop.clone();

        let mut results = stream::iter(documents)
            .take_while(move |_| future::ready(!gate.is_cancelled()))
            .map(|doc| {
                let id = doc.id;
                let fut = work(doc);
                async move { (id, fut.await) }
            })
            .buffer_unordered(params.max_concurrent_requests.max(1));

        let mut run = DocumentRun::default();
        while let Some((id, result)) = results.next().await {
            match result? {
                Ok(()) => counters.record_success(),
                Err(message) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        stage = %stage,
                        document_id = %id,
                        error = %message,
                        "Document failed after retries"
                    );
                    let streak = counters.record_failure(&message);
                    run.failures.push((id, message));
                    if streak >= params.max_consecutive_failures.max(1) && !run.streak_exceeded {
                        run.streak_exceeded = true;
                        stop.cancel();
                    }
                }
            }

            if counters.should_report() {
                self.event_bus.emit_lossy(DoccatEvent::StageProgress {
                    session_id: session.session_id,
                    stage: stage.as_str().to_string(),
                    processed: counters.processed(),
                    total: counters.total(),
                    failed: counters.failed(),
                    timestamp: chrono::Utc::now(),
                });
            }
        }

        run.cancelled = cancel.is_cancelled();
        Ok(run)
    }

    /// Decide a per-document stage's outcome and persist its document failures
    ///
    /// Failures are only written when the stage as a whole succeeds; a fatal
    /// or cancelled stage is re-run in full for the failed documents on resume.
    pub(crate) async fn conclude(
        &self,
        stage: Stage,
        counters: &StageCounters,
        run: DocumentRun,
        details: serde_json::Value,
    ) -> Result<StageOutcome> {
        let summary = counters.summary(details);
        let last_error = counters.last_error().unwrap_or_default();

        if run.cancelled {
            return Ok(StageOutcome::Cancelled(summary));
        }
        if run.streak_exceeded {
            return Ok(StageOutcome::Fatal {
                error: format!(
                    "{} consecutive document failures in {}; last error: {}",
                    run.failures.len(),
                    stage,
                    last_error
                ),
                summary,
            });
        }
        if counters.all_failed() {
            return Ok(StageOutcome::Fatal {
                error: format!(
                    "All {} attempted documents failed in {}; last error: {}",
                    counters.failed(),
                    stage,
                    last_error
                ),
                summary,
            });
        }

        db::documents::mark_stage_failures(&self.db, stage, &run.failures).await?;
        Ok(StageOutcome::Completed(summary))
    }

    /// Read a document's extracted text, or a placeholder for image-only documents
    pub(crate) async fn document_text(
        storage: &Arc<dyn BlobStore>,
        doc: &Document,
    ) -> std::result::Result<String, String> {
        match &doc.text_path {
            Some(path) => storage
                .get(path)
                .await
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .map_err(|e| e.to_string()),
            None => Ok(format!(
                "[image attachment: {} ({})]",
                doc.file_name,
                doc.mime_type.as_deref().unwrap_or("unknown type")
            )),
        }
    }
}

/// Stage an operator-failed session resumes into
///
/// Automatic states resume their own stage. A session failed before it
/// started resumes at triage; one failed during review resumes through
/// reclustering, which returns it to READY_FOR_VALIDATION.
fn failed_stage_for(session: &ImportSession) -> Option<Stage> {
    match session.state {
        PipelineState::NotStarted => Some(Stage::Triage),
        PipelineState::ReadyForValidation => Some(Stage::ReCluster),
        state => state.running_stage(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_in(state: PipelineState) -> ImportSession {
        let mut session = ImportSession::new("firm".to_string(), "archive.pst".to_string(), 10, Default::default());
        session.state = state;
        session
    }

    #[test]
    fn test_failed_stage_for_every_failable_state() {
        assert_eq!(failed_stage_for(&session_in(PipelineState::NotStarted)), Some(Stage::Triage));
        assert_eq!(failed_stage_for(&session_in(PipelineState::Embedding)), Some(Stage::Embed));
        assert_eq!(
            failed_stage_for(&session_in(PipelineState::ReadyForValidation)),
            Some(Stage::ReCluster)
        );
        assert_eq!(failed_stage_for(&session_in(PipelineState::Extracting)), Some(Stage::Extract));
    }
}
