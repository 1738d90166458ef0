//! Service modules for the categorization pipeline
//!
//! - Collaborators: [`scoring`] (triage / embedding / naming) and [`storage`] (blobs)
//! - Pipeline: fingerprinting, deduplication, clustering, naming, orchestration
//! - Review: batch allocation and the validation workflow

pub mod batch_allocator;
pub mod clustering;
pub mod deduplicator;
pub mod fingerprint;
pub mod naming;
pub mod scoring;
pub mod storage;
pub mod validation;
pub mod workflow_orchestrator;

pub use batch_allocator::{BatchAllocator, BatchPull};
pub use clustering::{cluster_vectors, cosine_similarity, membership_hash, ClusterPlan};
pub use deduplicator::{DedupReport, Deduplicator};
pub use fingerprint::{choose_canonical, fingerprint_bytes, fingerprint_text, normalize_text};
pub use naming::{ClusterNamer, NamingError, NamingOutcome};
pub use scoring::{ClusterNaming, HttpScoringClient, ScoringClient, ScoringError, TriageResult};
pub use storage::{BlobStore, FsBlobStore, MemoryBlobStore, StorageError};
pub use validation::{DocumentAction, DocumentDecision, ValidationWorkflow};
pub use workflow_orchestrator::PipelineOrchestrator;
