//! Shared fixtures for doccat-ingest integration tests
//!
//! - `MockScoringClient`: deterministic triage / embedding / naming with
//!   failure injection
//! - `TestEnv`: database, event bus, blob store and the three services wired
//!   together the way `main` wires them

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

use doccat_common::events::{DoccatEvent, EventBus};
use doccat_ingest::db;
use doccat_ingest::models::{
    ClusteringPolicy, ImportSession, NewDocument, PipelineParameters, PipelineState, TriageLabel,
};
use doccat_ingest::services::{
    BatchAllocator, ClusterNaming, MemoryBlobStore, PipelineOrchestrator, ScoringClient, ScoringError,
    TriageResult, ValidationWorkflow,
};
use doccat_ingest::AppState;

/// Topics the mock embeds as orthogonal unit vectors
pub const TOPICS: [&str; 4] = ["invoice", "contract", "payroll", "travel"];

/// Scripted scoring collaborator
///
/// Document texts carry their topic as `topic:<name>`; texts containing
/// `IRRELEVANT` are triaged irrelevant. Triage fails permanently for any text
/// containing a marker registered with [`MockScoringClient::fail_triage_for`].
#[derive(Default)]
pub struct MockScoringClient {
    failing_markers: Mutex<HashSet<String>>,
    pub triage_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
    pub name_calls: AtomicUsize,
}

impl MockScoringClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_triage_for(&self, marker: &str) {
        self.failing_markers
            .lock()
            .unwrap()
            .insert(marker.to_string());
    }

    fn topic_of(text: &str) -> Option<usize> {
        TOPICS
            .iter()
            .position(|topic| text.contains(&format!("topic:{}", topic)))
    }
}

#[async_trait]
impl ScoringClient for MockScoringClient {
    async fn triage(&self, text: &str) -> Result<TriageResult, ScoringError> {
        self.triage_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_markers
            .lock()
            .unwrap()
            .iter()
            .any(|m| text.contains(m.as_str()));
        if failing {
            return Err(ScoringError::Api(422, "unreadable document".to_string()));
        }

        let label = if text.contains("IRRELEVANT") {
            TriageLabel::Irrelevant
        } else {
            TriageLabel::Relevant
        };
        Ok(TriageResult {
            label,
            confidence: 0.9,
            reason: Some("mock".to_string()),
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ScoringError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let mut vector = vec![0.0f32; TOPICS.len()];
        match Self::topic_of(text) {
            Some(i) => vector[i] = 1.0,
            // Equidistant from every topic: never clears a 0.9 threshold
            None => vector.iter_mut().for_each(|v| *v = 0.5),
        }
        Ok(vector)
    }

    async fn name(&self, samples: &[String]) -> Result<ClusterNaming, ScoringError> {
        self.name_calls.fetch_add(1, Ordering::SeqCst);
        let topic = samples
            .iter()
            .find_map(|s| Self::topic_of(s))
            .map(|i| TOPICS[i])
            .unwrap_or("misc");
        Ok(ClusterNaming {
            name: format!("{} documents", topic),
            name_translation: None,
            description: Some(format!("{} samples", samples.len())),
        })
    }

    fn dimension(&self) -> Option<usize> {
        Some(TOPICS.len())
    }
}

/// One document to register
pub struct TestDoc {
    pub text: String,
    pub received_at: Option<DateTime<Utc>>,
    pub ocr: bool,
}

impl TestDoc {
    pub fn topic(topic: &str, n: usize) -> Self {
        Self {
            text: format!("topic:{} document number {}", topic, n),
            received_at: Some(march(1 + (n % 28) as u32)),
            ocr: false,
        }
    }

    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            received_at: Some(march(1)),
            ocr: false,
        }
    }

    pub fn ocr(mut self) -> Self {
        self.ocr = true;
        self
    }

    pub fn received(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }
}

pub fn march(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap()
}

/// Parameters every scenario starts from
pub fn test_parameters() -> PipelineParameters {
    PipelineParameters {
        clustering: Some(ClusteringPolicy {
            similarity_threshold: 0.9,
            min_cluster_size: 2,
        }),
        batch_size: 10,
        scoring_backoff_ms: 1,
        max_concurrent_requests: 4,
        ..Default::default()
    }
}

pub struct TestEnv {
    pub pool: sqlx::SqlitePool,
    pub event_bus: EventBus,
    pub storage: Arc<MemoryBlobStore>,
    pub scoring: Arc<MockScoringClient>,
    pub orchestrator: PipelineOrchestrator,
    pub allocator: BatchAllocator,
    pub validation: ValidationWorkflow,
    /// Keeps a file database alive
    _dir: Option<TempDir>,
}

impl TestEnv {
    /// Single-connection in-memory database
    pub async fn new() -> Self {
        let pool = db::init_memory_database().await.unwrap();
        Self::with_pool(pool, None)
    }

    /// WAL file database with a real connection pool (concurrency tests)
    pub async fn with_file_db() -> Self {
        let dir = TempDir::new().unwrap();
        let pool = db::init_database_pool(&dir.path().join("doccat.db"), 16)
            .await
            .unwrap();
        Self::with_pool(pool, Some(dir))
    }

    fn with_pool(pool: sqlx::SqlitePool, dir: Option<TempDir>) -> Self {
        let event_bus = EventBus::new(1000);
        let storage = Arc::new(MemoryBlobStore::new());
        let scoring = Arc::new(MockScoringClient::new());
        Self {
            orchestrator: PipelineOrchestrator::new(
                pool.clone(),
                event_bus.clone(),
                scoring.clone(),
                storage.clone(),
            ),
            allocator: BatchAllocator::new(pool.clone(), event_bus.clone()),
            validation: ValidationWorkflow::new(pool.clone(), event_bus.clone()),
            pool,
            event_bus,
            storage,
            scoring,
            _dir: dir,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.pool.clone(),
            self.event_bus.clone(),
            self.scoring.clone(),
            self.storage.clone(),
        )
    }

    pub async fn create_session(&self, parameters: PipelineParameters) -> Uuid {
        let session = ImportSession::new(
            "acme".to_string(),
            "mailbox-export.pst".to_string(),
            4096,
            parameters,
        );
        db::sessions::insert_session(&self.pool, &session).await.unwrap();
        session.session_id
    }

    /// Store text + raw bytes for each fixture and register the documents
    pub async fn add_documents(&self, session_id: Uuid, fixtures: &[TestDoc]) -> Vec<Uuid> {
        let base = Utc::now() - Duration::hours(1);
        let mut documents = Vec::with_capacity(fixtures.len());
        for (i, fixture) in fixtures.iter().enumerate() {
            let raw_path = format!("sessions/{}/raw/{}.eml", session_id, i);
            let text_path = format!("sessions/{}/text/{}.txt", session_id, i);
            self.storage.insert(raw_path.clone(), fixture.text.as_bytes().to_vec()).await;
            self.storage.insert(text_path.clone(), fixture.text.as_bytes().to_vec()).await;
            documents.push(NewDocument {
                storage_path: raw_path,
                text_path: Some(text_path),
                file_name: format!("message-{}.eml", i),
                mime_type: Some("message/rfc822".to_string()),
                ocr: fixture.ocr,
                received_at: fixture.received_at,
                extracted_at: Some(base + Duration::seconds(i as i64)),
            });
        }
        db::documents::insert_documents(&self.pool, session_id, &documents)
            .await
            .unwrap()
    }

    /// Claim the start and drive the pipeline in the foreground
    pub async fn run_pipeline(&self, session_id: Uuid) -> PipelineState {
        self.orchestrator.claim_start(session_id).await.unwrap();
        self.orchestrator.drive(session_id).await.unwrap()
    }

    /// A session in READY_FOR_VALIDATION built from `fixtures`
    pub async fn reviewable_session(&self, parameters: PipelineParameters, fixtures: &[TestDoc]) -> Uuid {
        let session_id = self.create_session(parameters).await;
        self.add_documents(session_id, fixtures).await;
        let state = self.run_pipeline(session_id).await;
        assert_eq!(state, PipelineState::ReadyForValidation);
        session_id
    }

    pub async fn state(&self, session_id: Uuid) -> PipelineState {
        db::sessions::get_session(&self.pool, session_id)
            .await
            .unwrap()
            .state
    }
}

/// `count` documents per topic, topics interleaved
pub fn topic_documents(topics: &[&str], count: usize) -> Vec<TestDoc> {
    let mut fixtures = Vec::new();
    for n in 0..count {
        for topic in topics {
            fixtures.push(TestDoc::topic(topic, fixtures.len() + n));
        }
    }
    fixtures
}

/// Every event currently buffered on `rx`
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<DoccatEvent>) -> Vec<DoccatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
