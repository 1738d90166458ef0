//! Cluster database operations

use doccat_common::time::{from_db, from_db_opt, to_db};
use doccat_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::documents::parse_uuid;
use crate::models::{Cluster, ClusterStatus};
use crate::utils::begin_monitored;

const CLUSTER_COLUMNS: &str = r#"
    id, session_id, suggested_name, approved_name, name_translation, description,
    status, document_count, sample_document_ids, membership_hash, deleted,
    deleted_by, deleted_at, merged_into, created_round, created_at, updated_at
"#;

/// Name produced for a membership, reused while membership is unchanged
#[derive(Debug, Clone, PartialEq)]
pub struct CachedName {
    pub name: String,
    pub name_translation: Option<String>,
    pub description: Option<String>,
}

/// Create a PENDING cluster and attach its (still unclustered) members
pub async fn create_cluster(
    pool: &SqlitePool,
    session_id: Uuid,
    member_ids: &[Uuid],
    sample_ids: &[Uuid],
    round: i64,
) -> Result<Cluster> {
    let id = Uuid::new_v4();
    let now = to_db(chrono::Utc::now());
    let samples = serde_json::to_string(sample_ids)
        .map_err(|e| Error::Internal(format!("Failed to serialize samples: {}", e)))?;

    let mut tx = begin_monitored(pool, "clusters::create_cluster").await?;
    sqlx::query(
        r#"
        INSERT INTO clusters (id, session_id, status, sample_document_ids, created_round, created_at, updated_at)
        VALUES (?, ?, 'PENDING', ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(session_id.to_string())
    .bind(samples)
    .bind(round)
    .bind(&now)
    .bind(&now)
    .execute(tx.conn())
    .await?;

    for member in member_ids {
        sqlx::query(
            "UPDATE documents SET cluster_id = ? WHERE id = ? AND session_id = ? AND cluster_id IS NULL",
        )
        .bind(id.to_string())
        .bind(member.to_string())
        .bind(session_id.to_string())
        .execute(tx.conn())
        .await?;
    }
    recount_on(tx.conn(), id).await?;

    let cluster = get_cluster_on(tx.conn(), id).await?;
    tx.commit().await?;
    Ok(cluster)
}

pub async fn get_cluster(pool: &SqlitePool, id: Uuid) -> Result<Cluster> {
    let mut conn = pool.acquire().await?;
    get_cluster_on(&mut conn, id).await
}

pub async fn get_cluster_on(conn: &mut SqliteConnection, id: Uuid) -> Result<Cluster> {
    let row = sqlx::query(&format!("SELECT {} FROM clusters WHERE id = ?", CLUSTER_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref()
        .map(row_to_cluster)
        .transpose()?
        .ok_or_else(|| Error::NotFound(format!("Cluster {} not found", id)))
}

/// Clusters of a session; hidden ones (soft-deleted, merged away) only on request
pub async fn list_for_session(pool: &SqlitePool, session_id: Uuid, include_hidden: bool) -> Result<Vec<Cluster>> {
    let filter = if include_hidden {
        ""
    } else {
        "AND deleted = 0 AND merged_into IS NULL"
    };
    let rows = sqlx::query(&format!(
        "SELECT {} FROM clusters WHERE session_id = ? {} ORDER BY created_round, created_at, id",
        CLUSTER_COLUMNS, filter
    ))
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_cluster).collect()
}

/// Live, non-rejected clusters with members (naming candidates)
pub async fn list_nameable(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Cluster>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM clusters
        WHERE session_id = ? AND deleted = 0 AND merged_into IS NULL
          AND status != 'REJECTED' AND document_count > 0
        ORDER BY created_round, created_at, id
        "#,
        CLUSTER_COLUMNS
    ))
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_cluster).collect()
}

/// Record the name proposed for the cluster's current membership
pub async fn set_naming(
    pool: &SqlitePool,
    id: Uuid,
    naming: &CachedName,
    membership_hash: &str,
    sample_ids: &[Uuid],
) -> Result<()> {
    let samples = serde_json::to_string(sample_ids)
        .map_err(|e| Error::Internal(format!("Failed to serialize samples: {}", e)))?;
    sqlx::query(
        r#"
        UPDATE clusters
        SET suggested_name = ?, name_translation = ?, description = ?,
            membership_hash = ?, sample_document_ids = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&naming.name)
    .bind(&naming.name_translation)
    .bind(&naming.description)
    .bind(membership_hash)
    .bind(samples)
    .bind(to_db(chrono::Utc::now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn cached_name(pool: &SqlitePool, session_id: Uuid, membership_hash: &str) -> Result<Option<CachedName>> {
    let row = sqlx::query(
        "SELECT name, name_translation, description FROM cluster_name_cache WHERE session_id = ? AND membership_hash = ?",
    )
    .bind(session_id.to_string())
    .bind(membership_hash)
    .fetch_optional(pool)
    .await?;

    row.map(|r| -> Result<CachedName> {
        Ok(CachedName {
            name: r.try_get("name")?,
            name_translation: r.try_get("name_translation")?,
            description: r.try_get("description")?,
        })
    })
    .transpose()
}

/// First writer wins; a concurrent namer for the same membership is ignored
pub async fn store_cached_name(
    pool: &SqlitePool,
    session_id: Uuid,
    membership_hash: &str,
    naming: &CachedName,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cluster_name_cache (session_id, membership_hash, name, name_translation, description, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(session_id, membership_hash) DO NOTHING
        "#,
    )
    .bind(session_id.to_string())
    .bind(membership_hash)
    .bind(&naming.name)
    .bind(&naming.name_translation)
    .bind(&naming.description)
    .bind(to_db(chrono::Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Recompute `document_count` from the documents actually pointing at the cluster
pub async fn recount_on(conn: &mut SqliteConnection, cluster_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        UPDATE clusters
        SET document_count = (SELECT COUNT(*) FROM documents WHERE cluster_id = ?1)
        WHERE id = ?1
        RETURNING document_count
        "#,
    )
    .bind(cluster_id.to_string())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Cluster {} not found", cluster_id)))?;
    Ok(count)
}

/// Detach reclassified documents and members of rejected clusters
///
/// Returns the number of documents released back to clustering. Approved and
/// pending clusters keep the rest of their members.
pub async fn detach_for_reclustering(pool: &SqlitePool, session_id: Uuid) -> Result<u64> {
    let mut tx = begin_monitored(pool, "clusters::detach_for_reclustering").await?;

    let affected: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT cluster_id FROM documents
        WHERE session_id = ? AND cluster_id IS NOT NULL
          AND (pending_recluster = 1
               OR cluster_id IN (SELECT id FROM clusters WHERE status = 'REJECTED'))
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(tx.conn())
    .await?;

    let detached = sqlx::query(
        r#"
        UPDATE documents
        SET cluster_id = NULL, pending_recluster = 0
        WHERE session_id = ?
          AND (pending_recluster = 1
               OR cluster_id IN (SELECT id FROM clusters WHERE status = 'REJECTED'))
        "#,
    )
    .bind(session_id.to_string())
    .execute(tx.conn())
    .await?
    .rows_affected();

    for cluster_id in affected {
        recount_on(tx.conn(), parse_uuid(&cluster_id)?).await?;
    }

    tx.commit().await?;
    Ok(detached)
}

pub(crate) fn row_to_cluster(row: &SqliteRow) -> Result<Cluster> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    let status: String = row.try_get("status")?;
    let samples: String = row.try_get("sample_document_ids")?;
    let merged_into: Option<String> = row.try_get("merged_into")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Cluster {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        suggested_name: row.try_get("suggested_name")?,
        approved_name: row.try_get("approved_name")?,
        name_translation: row.try_get("name_translation")?,
        description: row.try_get("description")?,
        status: ClusterStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("Unknown cluster status: {}", status)))?,
        document_count: row.try_get("document_count")?,
        sample_document_ids: serde_json::from_str(&samples)
            .map_err(|e| Error::Internal(format!("Invalid sample ids: {}", e)))?,
        membership_hash: row.try_get("membership_hash")?,
        deleted: row.try_get("deleted")?,
        deleted_by: row.try_get("deleted_by")?,
        deleted_at: from_db_opt(row.try_get("deleted_at")?)?,
        merged_into: merged_into.as_deref().map(parse_uuid).transpose()?,
        created_round: row.try_get("created_round")?,
        created_at: from_db(&created_at)?,
        updated_at: from_db(&updated_at)?,
    })
}
