//! Document database operations
//!
//! Per-document stage results are written with conditional updates
//! (`... WHERE <result> IS NULL`) so a resumed or duplicated stage run never
//! overwrites a result that already landed.

use doccat_common::time::{from_db, from_db_opt, to_db};
use doccat_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::models::{
    Document, NewDocument, PipelineState, ReviewOutcome, Stage, TriageLabel, ValidationStatus,
};
use crate::utils::begin_monitored;

pub(crate) const DOCUMENT_COLUMNS: &str = r#"
    id, session_id, batch_id, storage_path, text_path, file_name, mime_type,
    fidelity, received_at, extracted_at, triage_label, triage_confidence,
    triage_reason, fingerprint, duplicate_of, is_canonical, embedding, cluster_id,
    validation_status, reclassification_note, reclassification_round,
    pending_recluster, review_outcome, reviewed_by, reviewed_at, deleted,
    deleted_by, deleted_at, failed_stage, stage_error
"#;

/// Register extracted documents; only while the session is NOT_STARTED
pub async fn insert_documents(
    pool: &SqlitePool,
    session_id: Uuid,
    documents: &[NewDocument],
) -> Result<Vec<Uuid>> {
    for doc in documents {
        if doc.storage_path.trim().is_empty() {
            return Err(Error::InvalidInput("storage_path must not be empty".to_string()));
        }
        if doc.file_name.trim().is_empty() {
            return Err(Error::InvalidInput("file_name must not be empty".to_string()));
        }
    }

    let mut tx = begin_monitored(pool, "documents::insert_documents").await?;
    super::sessions::guard_state_on(
        tx.conn(),
        session_id,
        &[PipelineState::NotStarted],
        super::sessions::INVALID_TRANSITION,
    )
    .await?;

    let now = chrono::Utc::now();
    let mut ids = Vec::with_capacity(documents.len());
    for doc in documents {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO documents (
                id, session_id, storage_path, text_path, file_name, mime_type,
                fidelity, received_at, extracted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(session_id.to_string())
        .bind(&doc.storage_path)
        .bind(&doc.text_path)
        .bind(&doc.file_name)
        .bind(&doc.mime_type)
        .bind(doc.fidelity())
        .bind(doc.received_at.map(to_db))
        .bind(to_db(doc.extracted_at.unwrap_or(now)))
        .execute(tx.conn())
        .await?;
        ids.push(id);
    }

    tx.commit().await?;

    tracing::debug!(session_id = %session_id, count = ids.len(), "Registered documents");
    Ok(ids)
}

pub async fn load_document(pool: &SqlitePool, id: Uuid) -> Result<Option<Document>> {
    let row = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_document).transpose()
}

pub async fn get_document(pool: &SqlitePool, id: Uuid) -> Result<Document> {
    load_document(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Document {} not found", id)))
}

/// Load a document inside an open transaction
pub async fn get_document_on(conn: &mut SqliteConnection, id: Uuid) -> Result<Document> {
    let row = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref()
        .map(row_to_document)
        .transpose()?
        .ok_or_else(|| Error::NotFound(format!("Document {} not found", id)))
}

/// Session of a document (routing decisions to their session guard)
pub async fn session_of(pool: &SqlitePool, id: Uuid) -> Result<Uuid> {
    let session: Option<String> = sqlx::query_scalar("SELECT session_id FROM documents WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    let session = session.ok_or_else(|| Error::NotFound(format!("Document {} not found", id)))?;
    parse_uuid(&session)
}

async fn fetch_where(pool: &SqlitePool, condition: &str, session_id: Uuid) -> Result<Vec<Document>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE session_id = ? AND {} ORDER BY extracted_at, id",
        DOCUMENT_COLUMNS, condition
    ))
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_document).collect()
}

/// Every document of a session in stable (extraction) order
pub async fn list_for_session(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Document>> {
    fetch_where(pool, "1 = 1", session_id).await
}

/// Documents without a triage result and without a recorded failure
pub async fn list_pending_triage(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Document>> {
    fetch_where(pool, "triage_label IS NULL AND stage_error IS NULL AND deleted = 0", session_id).await
}

/// Documents taking part in duplicate detection
pub async fn list_dedup_candidates(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Document>> {
    fetch_where(pool, "stage_error IS NULL AND deleted = 0", session_id).await
}

/// Canonical, non-irrelevant documents eligible for embedding
pub async fn list_embedding_candidates(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Document>> {
    fetch_where(
        pool,
        "is_canonical = 1 AND triage_label IS NOT NULL AND triage_label != 'IRRELEVANT' \
         AND stage_error IS NULL AND deleted = 0",
        session_id,
    )
    .await
}

/// Embedded documents not yet in any cluster, in stable order
pub async fn list_unclustered(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Document>> {
    fetch_where(
        pool,
        "is_canonical = 1 AND triage_label != 'IRRELEVANT' AND stage_error IS NULL \
         AND deleted = 0 AND embedding IS NOT NULL AND cluster_id IS NULL",
        session_id,
    )
    .await
}

/// Non-canonical documents (the duplicate lane)
pub async fn list_duplicates(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Document>> {
    fetch_where(pool, "is_canonical = 0", session_id).await
}

/// Members of a cluster in stable order
pub async fn list_cluster_members(pool: &SqlitePool, cluster_id: Uuid) -> Result<Vec<Document>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE cluster_id = ? ORDER BY extracted_at, id",
        DOCUMENT_COLUMNS
    ))
    .bind(cluster_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_document).collect()
}

/// Members of the given batches, grouped by batch order then extraction order
pub async fn list_for_batches(pool: &SqlitePool, batch_ids: &[Uuid]) -> Result<Vec<Document>> {
    if batch_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; batch_ids.len()].join(", ");
    let sql = format!(
        r#"
        SELECT {} FROM documents d
        WHERE batch_id IN ({})
        ORDER BY (SELECT sort_key FROM batches b WHERE b.id = d.batch_id),
                 (SELECT ordinal FROM batches b WHERE b.id = d.batch_id),
                 extracted_at, id
        "#,
        DOCUMENT_COLUMNS, placeholders
    );
    let mut query = sqlx::query(&sql);
    for id in batch_ids {
        query = query.bind(id.to_string());
    }
    let rows = query.fetch_all(pool).await?;
    rows.iter().map(row_to_document).collect()
}

/// Store a triage result unless one already exists
pub async fn record_triage(
    pool: &SqlitePool,
    id: Uuid,
    label: TriageLabel,
    confidence: f32,
    reason: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE documents
        SET triage_label = ?, triage_confidence = ?, triage_reason = ?
        WHERE id = ? AND triage_label IS NULL
        "#,
    )
    .bind(label.as_str())
    .bind(confidence)
    .bind(reason)
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_fingerprint(pool: &SqlitePool, id: Uuid, fingerprint: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET fingerprint = ? WHERE id = ? AND fingerprint IS NULL")
        .bind(fingerprint)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Store an embedding vector unless one already exists
pub async fn store_embedding(pool: &SqlitePool, id: Uuid, vector: &[f32]) -> Result<bool> {
    let result = sqlx::query("UPDATE documents SET embedding = ? WHERE id = ? AND embedding IS NULL")
        .bind(encode_embedding(vector))
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Record documents whose per-document stage work exhausted its retries
///
/// Failed triage concludes as UNCERTAIN so reviewers see "needs manual review".
pub async fn mark_stage_failures(
    pool: &SqlitePool,
    stage: Stage,
    failures: &[(Uuid, String)],
) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }

    let mut tx = begin_monitored(pool, "documents::mark_stage_failures").await?;
    for (id, error) in failures {
        sqlx::query(
            r#"
            UPDATE documents
            SET failed_stage = ?,
                stage_error = ?,
                triage_label = CASE WHEN ? THEN COALESCE(triage_label, 'UNCERTAIN') ELSE triage_label END
            WHERE id = ?
            "#,
        )
        .bind(stage.as_str())
        .bind(error)
        .bind(stage == Stage::Triage)
        .bind(id.to_string())
        .execute(tx.conn())
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Write duplicate-group results in one transaction
///
/// `assignments` maps each document to its canonical sibling (None = canonical).
pub async fn apply_duplicate_groups(pool: &SqlitePool, assignments: &[(Uuid, Option<Uuid>)]) -> Result<()> {
    let mut tx = begin_monitored(pool, "documents::apply_duplicate_groups").await?;
    for (id, canonical) in assignments {
        sqlx::query("UPDATE documents SET is_canonical = ?, duplicate_of = ? WHERE id = ?")
            .bind(canonical.is_none())
            .bind(canonical.map(|c| c.to_string()))
            .bind(id.to_string())
            .execute(tx.conn())
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// f32 little-endian
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Internal(format!(
            "Embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid id {}: {}", value, e)))
}

fn parse_opt_uuid(value: Option<String>) -> Result<Option<Uuid>> {
    value.as_deref().map(parse_uuid).transpose()
}

pub(crate) fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    let extracted_at: String = row.try_get("extracted_at")?;
    let triage_label: Option<String> = row.try_get("triage_label")?;
    let validation_status: String = row.try_get("validation_status")?;
    let review_outcome: Option<String> = row.try_get("review_outcome")?;
    let failed_stage: Option<String> = row.try_get("failed_stage")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;

    Ok(Document {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        batch_id: parse_opt_uuid(row.try_get("batch_id")?)?,
        storage_path: row.try_get("storage_path")?,
        text_path: row.try_get("text_path")?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        fidelity: row.try_get("fidelity")?,
        received_at: from_db_opt(row.try_get("received_at")?)?,
        extracted_at: from_db(&extracted_at)?,
        triage_label: triage_label.as_deref().and_then(TriageLabel::parse),
        triage_confidence: row.try_get("triage_confidence")?,
        triage_reason: row.try_get("triage_reason")?,
        fingerprint: row.try_get("fingerprint")?,
        duplicate_of: parse_opt_uuid(row.try_get("duplicate_of")?)?,
        is_canonical: row.try_get("is_canonical")?,
        embedding: embedding.as_deref().map(decode_embedding).transpose()?,
        cluster_id: parse_opt_uuid(row.try_get("cluster_id")?)?,
        validation_status: ValidationStatus::parse(&validation_status).ok_or_else(|| {
            Error::Internal(format!("Unknown validation status: {}", validation_status))
        })?,
        reclassification_note: row.try_get("reclassification_note")?,
        reclassification_round: row.try_get("reclassification_round")?,
        pending_recluster: row.try_get("pending_recluster")?,
        review_outcome: review_outcome.as_deref().and_then(ReviewOutcome::parse),
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: from_db_opt(row.try_get("reviewed_at")?)?,
        deleted: row.try_get("deleted")?,
        deleted_by: row.try_get("deleted_by")?,
        deleted_at: from_db_opt(row.try_get("deleted_at")?)?,
        failed_stage: failed_stage.map(|s| s.parse()).transpose()?,
        stage_error: row.try_get("stage_error")?,
    })
}
