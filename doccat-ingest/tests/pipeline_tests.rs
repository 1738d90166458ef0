//! Pipeline integration tests
//!
//! Drives sessions through the automatic stages with the scripted scoring
//! client: happy path to review and export, duplicate detection, per-document
//! failures, operator failure and resume.

mod helpers;

use std::sync::atomic::Ordering;

use doccat_common::events::DoccatEvent;
use doccat_common::Error;
use doccat_ingest::db;
use doccat_ingest::db::sessions::INVALID_TRANSITION;
use doccat_ingest::models::{
    PipelineState, ReviewDocument, ReviewState, Stage, StageStatus, ValidationStatus,
};
use doccat_ingest::services::workflow_orchestrator::{export_manifest_path, ExportManifest};
use doccat_ingest::services::{BlobStore, Deduplicator, DocumentAction};
use tokio_util::sync::CancellationToken;

use helpers::{march, test_parameters, topic_documents, TestDoc, TestEnv};

#[tokio::test]
async fn test_pipeline_reaches_review_with_named_clusters() {
    let env = TestEnv::new().await;
    let session_id = env.create_session(test_parameters()).await;

    let mut fixtures = topic_documents(&["invoice", "contract"], 4);
    fixtures.push(TestDoc::text("IRRELEVANT newsletter"));
    env.add_documents(session_id, &fixtures).await;

    let state = env.run_pipeline(session_id).await;
    assert_eq!(state, PipelineState::ReadyForValidation);

    let session = db::sessions::get_session(&env.pool, session_id).await.unwrap();
    assert_eq!(session.checkpoint, Some(Stage::Name));
    // Every canonical document is batched, irrelevant ones included
    assert_eq!(session.total_documents, 9);

    let stages = db::stage_stats::list_for_session(&env.pool, session_id).await.unwrap();
    for stage in [Stage::Triage, Stage::Deduplicate, Stage::Embed, Stage::Cluster, Stage::Name] {
        let stats = stages
            .iter()
            .find(|s| s.stage == stage)
            .unwrap_or_else(|| panic!("no stats for {}", stage));
        assert_eq!(stats.status, StageStatus::Succeeded, "{}", stage);
        assert_eq!(stats.failed_documents, 0, "{}", stage);
    }

    let clusters = db::clusters::list_for_session(&env.pool, session_id, false).await.unwrap();
    assert_eq!(clusters.len(), 2);
    let mut names: Vec<_> = clusters
        .iter()
        .map(|c| c.suggested_name.clone().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["contract documents", "invoice documents"]);
    assert!(clusters.iter().all(|c| c.document_count == 4));

    // Irrelevant documents are never embedded
    assert_eq!(env.scoring.embed_calls.load(Ordering::SeqCst), 8);

    let progress = db::batches::session_progress(&env.pool, session_id).await.unwrap();
    assert_eq!(progress.total, 9);
    assert_eq!(progress.remaining, 9);
    assert!(progress.is_consistent());
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let env = TestEnv::new().await;
    let session_id = env.create_session(test_parameters()).await;
    env.add_documents(session_id, &topic_documents(&["invoice"], 2)).await;

    env.orchestrator.claim_start(session_id).await.unwrap();
    match env.orchestrator.claim_start(session_id).await {
        Err(Error::Conflict { code, .. }) => assert_eq!(code, INVALID_TRANSITION),
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicates_point_at_highest_fidelity_copy() {
    let env = TestEnv::new().await;
    let session_id = env.create_session(test_parameters()).await;

    let forwarded = "topic:invoice Quarterly invoice #42 from Northwind";
    let fixtures = vec![
        // OCR copies are extracted first but lose to the native text
        TestDoc::text(forwarded).ocr(),
        TestDoc::text("topic:invoice  QUARTERLY invoice #42   from northwind").ocr(),
        TestDoc::text(forwarded),
        TestDoc::topic("invoice", 100),
        TestDoc::topic("contract", 101),
        TestDoc::topic("contract", 102),
    ];
    let ids = env.add_documents(session_id, &fixtures).await;

    assert_eq!(env.run_pipeline(session_id).await, PipelineState::ReadyForValidation);

    let duplicates = db::documents::list_duplicates(&env.pool, session_id).await.unwrap();
    assert_eq!(duplicates.len(), 2);
    for duplicate in &duplicates {
        assert_eq!(duplicate.duplicate_of, Some(ids[2]));
        assert!(duplicate.batch_id.is_none());
        assert_eq!(duplicate.review_state(), ReviewState::Duplicate);
    }

    let canonical = db::documents::get_document(&env.pool, ids[2]).await.unwrap();
    assert!(canonical.is_canonical);
    assert!(canonical.batch_id.is_some());

    let progress = db::batches::session_progress(&env.pool, session_id).await.unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.duplicates, 2);

    // Deduplication is idempotent: a second run changes nothing
    let snapshot = |docs: Vec<doccat_ingest::models::Document>| {
        let mut rows: Vec<_> = docs
            .into_iter()
            .map(|d| (d.id, d.is_canonical, d.duplicate_of, d.fingerprint))
            .collect();
        rows.sort();
        rows
    };
    let before = snapshot(db::documents::list_for_session(&env.pool, session_id).await.unwrap());

    let dedup = Deduplicator::new(env.pool.clone(), env.storage.clone());
    let report = dedup.run(session_id, 4, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.fingerprinted, 0);
    assert_eq!(report.duplicate_groups, 1);
    assert_eq!(report.duplicates, 2);

    let after = snapshot(db::documents::list_for_session(&env.pool, session_id).await.unwrap());
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_exact_duplicate_pair_is_excluded_from_clustering() {
    let env = TestEnv::new().await;
    let session_id = env.create_session(test_parameters()).await;

    let mut fixtures = topic_documents(&["invoice", "contract"], 4);
    fixtures.push(TestDoc::text("topic:payroll March payroll summary"));
    fixtures.push(TestDoc::text("topic:payroll March payroll summary"));
    let ids = env.add_documents(session_id, &fixtures).await;
    assert_eq!(ids.len(), 10);

    assert_eq!(env.run_pipeline(session_id).await, PipelineState::ReadyForValidation);

    let documents = db::documents::list_for_session(&env.pool, session_id).await.unwrap();
    assert_eq!(documents.iter().filter(|d| d.is_canonical).count(), 9);
    let duplicates = db::documents::list_duplicates(&env.pool, session_id).await.unwrap();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].id, ids[9]);
    assert_eq!(duplicates[0].duplicate_of, Some(ids[8]));

    assert_eq!(env.scoring.embed_calls.load(Ordering::SeqCst), 9);
    let session = db::sessions::get_session(&env.pool, session_id).await.unwrap();
    assert_eq!(session.total_documents, 9);
}

#[tokio::test]
async fn test_document_failures_do_not_fail_the_stage() {
    let env = TestEnv::new().await;
    env.scoring.fail_triage_for("UNREADABLE");
    let session_id = env.create_session(test_parameters()).await;

    let mut fixtures = topic_documents(&["invoice", "contract"], 25);
    for i in [3, 17, 41] {
        fixtures[i].text.push_str(" UNREADABLE");
    }
    let ids = env.add_documents(session_id, &fixtures).await;

    assert_eq!(env.run_pipeline(session_id).await, PipelineState::ReadyForValidation);

    let stages = db::stage_stats::list_for_session(&env.pool, session_id).await.unwrap();
    let triage = stages.iter().find(|s| s.stage == Stage::Triage).unwrap();
    assert_eq!(triage.status, StageStatus::Succeeded);
    assert_eq!(triage.documents_in, 50);
    assert_eq!(triage.failed_documents, 3);

    // Permanent errors are not retried
    assert_eq!(env.scoring.triage_calls.load(Ordering::SeqCst), 50);
    assert_eq!(env.scoring.embed_calls.load(Ordering::SeqCst), 47);

    for i in [3, 17, 41] {
        let doc = db::documents::get_document(&env.pool, ids[i]).await.unwrap();
        assert_eq!(doc.failed_stage, Some(Stage::Triage));
        assert!(doc.stage_error.is_some());
        assert!(doc.embedding.is_none());
        assert!(doc.cluster_id.is_none());
        assert!(doc.batch_id.is_none());

        // Reviewers never see the collaborator error
        let view = ReviewDocument::from(&doc);
        assert_ne!(view.review_state, ReviewState::Ready);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("unreadable document"));
    }

    let clustered: i64 = db::clusters::list_for_session(&env.pool, session_id, false)
        .await
        .unwrap()
        .iter()
        .map(|c| c.document_count)
        .sum();
    assert_eq!(clustered, 47);

    // Failed documents are left out of review
    let session = db::sessions::get_session(&env.pool, session_id).await.unwrap();
    assert_eq!(session.total_documents, 47);
    let progress = db::batches::session_progress(&env.pool, session_id).await.unwrap();
    assert_eq!(progress.remaining, 47);
}

#[tokio::test]
async fn test_all_documents_failing_fails_the_session() {
    let env = TestEnv::new().await;
    env.scoring.fail_triage_for("topic:");
    let session_id = env.create_session(test_parameters()).await;
    env.add_documents(session_id, &topic_documents(&["invoice"], 4)).await;

    assert_eq!(env.run_pipeline(session_id).await, PipelineState::Failed);

    let session = db::sessions::get_session(&env.pool, session_id).await.unwrap();
    assert_eq!(session.failed_stage, Some(Stage::Triage));
    assert!(session.last_error.is_some());
    // FAILED is terminal until resumed, so it is stamped like completion
    assert!(session.completed_at.is_some());

    let last_error = env.orchestrator.last_error().await.unwrap();
    assert!(last_error.contains(&session_id.to_string()));
    assert!(last_error.ends_with(session.last_error.as_deref().unwrap()));
}

#[tokio::test]
async fn test_operator_failure_then_resume() {
    let env = TestEnv::new().await;
    let session_id = env.create_session(test_parameters()).await;
    env.add_documents(session_id, &topic_documents(&["invoice", "travel"], 3)).await;

    env.orchestrator.fail(session_id, "paused by operator").await.unwrap();
    let session = db::sessions::get_session(&env.pool, session_id).await.unwrap();
    assert_eq!(session.state, PipelineState::Failed);
    assert_eq!(session.failed_stage, Some(Stage::Triage));
    assert_eq!(session.last_error.as_deref(), Some("paused by operator"));
    assert!(session.completed_at.is_some());

    let resumed = env.orchestrator.claim_resume(session_id).await.unwrap();
    assert_eq!(resumed, PipelineState::Triaging);
    let session = db::sessions::get_session(&env.pool, session_id).await.unwrap();
    assert!(session.completed_at.is_none());
    assert_eq!(
        env.orchestrator.drive(session_id).await.unwrap(),
        PipelineState::ReadyForValidation
    );

    // Resuming twice is a transition conflict
    assert!(matches!(
        env.orchestrator.claim_resume(session_id).await,
        Err(Error::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_resume_skips_completed_documents() {
    let env = TestEnv::new().await;
    let session_id = env.create_session(test_parameters()).await;
    env.add_documents(session_id, &topic_documents(&["invoice", "contract"], 3)).await;

    assert_eq!(env.run_pipeline(session_id).await, PipelineState::ReadyForValidation);
    let triage_calls = env.scoring.triage_calls.load(Ordering::SeqCst);
    let embed_calls = env.scoring.embed_calls.load(Ordering::SeqCst);

    // Failed during review: resumes through reclustering
    env.orchestrator.fail(session_id, "maintenance").await.unwrap();
    assert_eq!(
        env.orchestrator.claim_resume(session_id).await.unwrap(),
        PipelineState::ReClustering
    );
    assert_eq!(
        env.orchestrator.drive(session_id).await.unwrap(),
        PipelineState::ReadyForValidation
    );

    assert_eq!(env.scoring.triage_calls.load(Ordering::SeqCst), triage_calls);
    assert_eq!(env.scoring.embed_calls.load(Ordering::SeqCst), embed_calls);
}

#[tokio::test]
async fn test_extraction_exports_approved_clusters() {
    let env = TestEnv::new().await;
    let fixtures: Vec<TestDoc> = topic_documents(&["invoice", "contract"], 3)
        .into_iter()
        .map(|s| s.received(march(5)))
        .collect();
    let session_id = env.reviewable_session(test_parameters(), &fixtures).await;

    let clusters = db::clusters::list_for_session(&env.pool, session_id, false).await.unwrap();
    let invoices = clusters
        .iter()
        .find(|c| c.suggested_name.as_deref() == Some("invoice documents"))
        .unwrap();
    env.validation
        .approve_cluster(invoices.id, "alice", Some("Invoices".to_string()))
        .await
        .unwrap();

    let members = db::documents::list_cluster_members(&env.pool, invoices.id).await.unwrap();
    env.validation
        .apply_document_action(members[0].id, "alice", DocumentAction::Delete)
        .await
        .unwrap();
    env.validation
        .apply_document_action(members[1].id, "alice", DocumentAction::Accept)
        .await
        .unwrap();

    env.orchestrator.claim_extraction(session_id).await.unwrap();
    assert_eq!(
        env.orchestrator.drive(session_id).await.unwrap(),
        PipelineState::Completed
    );

    let bytes = env.storage.get(&export_manifest_path(session_id)).await.unwrap();
    let manifest: ExportManifest = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(manifest.session_id, session_id);
    assert_eq!(manifest.categories.len(), 1);

    let category = &manifest.categories[0];
    assert_eq!(category.name, "Invoices");
    assert_eq!(category.documents.len(), 2);
    assert!(category.documents.iter().all(|d| d.document_id != members[0].id));
    assert!(category
        .documents
        .iter()
        .any(|d| d.document_id == members[1].id && d.validation_status == ValidationStatus::Accepted));

    let session = db::sessions::get_session(&env.pool, session_id).await.unwrap();
    assert!(session.completed_at.is_some());
    assert!(session.state.is_terminal());
}

#[tokio::test]
async fn test_background_start_emits_state_changes() {
    let env = TestEnv::new().await;
    let mut rx = env.event_bus.subscribe();
    let session_id = env.create_session(test_parameters()).await;
    env.add_documents(session_id, &topic_documents(&["payroll"], 3)).await;

    env.orchestrator.start(session_id).await.unwrap();

    let mut transitions = Vec::new();
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            if let DoccatEvent::SessionStateChanged { new_state, .. } = rx.recv().await.unwrap() {
                let done = new_state == "READY_FOR_VALIDATION";
                transitions.push(new_state);
                if done {
                    break;
                }
            }
        }
    })
    .await
    .expect("pipeline did not reach review");

    assert_eq!(
        transitions,
        vec![
            "TRIAGING",
            "DEDUPLICATING",
            "EMBEDDING",
            "CLUSTERING",
            "NAMING",
            "READY_FOR_VALIDATION"
        ]
    );
}
