//! Database access for doccat-ingest
//!
//! One row per session, document, batch and cluster, with foreign keys
//! session → documents/batches/clusters and cluster → documents. Soft deletes
//! use a flag + actor + timestamp triple; nothing is physically deleted while
//! the owning session exists.

pub mod audit;
pub mod batches;
pub mod clusters;
pub mod documents;
pub mod sessions;
pub mod settings;
pub mod stage_stats;

use doccat_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Component name recorded in `schema_version`
pub const SCHEMA_COMPONENT: &str = "doccat-ingest";

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

/// Open the database file and make sure every table exists
pub async fn init_database_pool(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    tracing::debug!("Connecting to database: {}", db_path.display());
    let pool = doccat_common::db::open_pool(db_path, max_connections).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Private in-memory database with the full schema (tests)
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = doccat_common::db::open_memory_pool().await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create doccat-ingest tables (idempotent)
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    doccat_common::db::record_schema_version(pool, SCHEMA_COMPONENT, SCHEMA_VERSION).await?;

    tracing::info!(
        version = SCHEMA_VERSION,
        "Database tables initialized (import_sessions, stage_stats, documents, batches, clusters, cluster_name_cache, audit_log)"
    );

    Ok(())
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS import_sessions (
        session_id TEXT PRIMARY KEY,
        firm_id TEXT NOT NULL,
        source_file_name TEXT NOT NULL,
        source_file_size INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL,
        parameters TEXT NOT NULL,
        parameters_version INTEGER NOT NULL,
        checkpoint TEXT,
        failed_stage TEXT,
        last_error TEXT,
        total_documents INTEGER NOT NULL DEFAULT 0,
        reclassification_count INTEGER NOT NULL DEFAULT 0,
        recluster_baseline INTEGER NOT NULL DEFAULT 0,
        reclustering_rounds INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        updated_at TEXT NOT NULL,
        CHECK (completed_at IS NULL OR state IN ('COMPLETED', 'FAILED'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_import_sessions_firm ON import_sessions(firm_id)",
    r#"
    CREATE TABLE IF NOT EXISTS stage_stats (
        session_id TEXT NOT NULL REFERENCES import_sessions(session_id),
        stage TEXT NOT NULL,
        status TEXT NOT NULL,
        documents_in INTEGER NOT NULL DEFAULT 0,
        documents_out INTEGER NOT NULL DEFAULT 0,
        failed_documents INTEGER NOT NULL DEFAULT 0,
        skipped_documents INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        last_error TEXT,
        details TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (session_id, stage)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES import_sessions(session_id),
        sort_key TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        member_count INTEGER NOT NULL,
        categorized_count INTEGER NOT NULL DEFAULT 0,
        skipped_count INTEGER NOT NULL DEFAULT 0,
        assigned_to TEXT,
        assigned_at TEXT,
        last_activity_at TEXT,
        created_at TEXT NOT NULL,
        CHECK (categorized_count >= 0 AND skipped_count >= 0),
        CHECK (categorized_count + skipped_count <= member_count),
        CHECK ((assigned_to IS NULL) = (assigned_at IS NULL))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_batches_session_order ON batches(session_id, sort_key, ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_batches_assignee ON batches(session_id, assigned_to)",
    r#"
    CREATE TABLE IF NOT EXISTS clusters (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES import_sessions(session_id),
        suggested_name TEXT,
        approved_name TEXT,
        name_translation TEXT,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'PENDING',
        document_count INTEGER NOT NULL DEFAULT 0,
        sample_document_ids TEXT NOT NULL DEFAULT '[]',
        membership_hash TEXT,
        deleted INTEGER NOT NULL DEFAULT 0,
        deleted_by TEXT,
        deleted_at TEXT,
        merged_into TEXT REFERENCES clusters(id),
        created_round INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK (document_count >= 0),
        CHECK (merged_into IS NULL OR document_count = 0),
        CHECK (deleted = 0 OR (deleted_by IS NOT NULL AND deleted_at IS NOT NULL))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_clusters_session ON clusters(session_id)",
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES import_sessions(session_id),
        batch_id TEXT REFERENCES batches(id),
        storage_path TEXT NOT NULL,
        text_path TEXT,
        file_name TEXT NOT NULL,
        mime_type TEXT,
        fidelity INTEGER NOT NULL DEFAULT 0,
        received_at TEXT,
        extracted_at TEXT NOT NULL,
        triage_label TEXT,
        triage_confidence REAL,
        triage_reason TEXT,
        fingerprint TEXT,
        duplicate_of TEXT REFERENCES documents(id),
        is_canonical INTEGER NOT NULL DEFAULT 1,
        embedding BLOB,
        cluster_id TEXT REFERENCES clusters(id),
        validation_status TEXT NOT NULL DEFAULT 'PENDING',
        reclassification_note TEXT,
        reclassification_round INTEGER NOT NULL DEFAULT 0,
        pending_recluster INTEGER NOT NULL DEFAULT 0,
        review_outcome TEXT,
        reviewed_by TEXT,
        reviewed_at TEXT,
        deleted INTEGER NOT NULL DEFAULT 0,
        deleted_by TEXT,
        deleted_at TEXT,
        failed_stage TEXT,
        stage_error TEXT,
        CHECK (is_canonical = 1 OR duplicate_of IS NOT NULL),
        CHECK (duplicate_of IS NULL OR duplicate_of != id),
        CHECK (validation_status != 'RECLASSIFIED' OR length(trim(reclassification_note)) > 0),
        CHECK (deleted = 0 OR (deleted_by IS NOT NULL AND deleted_at IS NOT NULL))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_session ON documents(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_batch ON documents(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_cluster ON documents(cluster_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_fingerprint ON documents(session_id, fingerprint)",
    r#"
    CREATE TABLE IF NOT EXISTS cluster_name_cache (
        session_id TEXT NOT NULL REFERENCES import_sessions(session_id),
        membership_hash TEXT NOT NULL,
        name TEXT NOT NULL,
        name_translation TEXT,
        description TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (session_id, membership_hash)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES import_sessions(session_id),
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_audit_log_session ON audit_log(session_id, id)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_tables_is_idempotent() {
        let pool = init_memory_database().await.unwrap();
        init_tables(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        for expected in [
            "audit_log",
            "batches",
            "cluster_name_cache",
            "clusters",
            "documents",
            "import_sessions",
            "schema_version",
            "settings",
            "stage_stats",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }

        assert_eq!(
            doccat_common::db::schema_version(&pool, SCHEMA_COMPONENT).await.unwrap(),
            Some(SCHEMA_VERSION)
        );
    }
}
