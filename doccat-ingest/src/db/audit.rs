//! Reviewer audit trail
//!
//! Written inside the same transaction as the change it records, so an entry
//! exists exactly when the change committed.

use doccat_common::time::{from_db, to_db};
use doccat_common::Result;
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub session_id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn record_on(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    actor: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    details: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (session_id, actor, action, entity_type, entity_id, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session_id.to_string())
    .bind(actor)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(details.to_string())
    .bind(to_db(chrono::Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Audit entries of a session, oldest first
pub async fn list_for_session(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, session_id, actor, action, entity_type, entity_id, details, created_at
        FROM audit_log WHERE session_id = ? ORDER BY id
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<AuditEntry> {
            let details: String = row.try_get("details")?;
            let created_at: String = row.try_get("created_at")?;
            Ok(AuditEntry {
                id: row.try_get("id")?,
                session_id,
                actor: row.try_get("actor")?,
                action: row.try_get("action")?,
                entity_type: row.try_get("entity_type")?,
                entity_id: row.try_get("entity_id")?,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                created_at: from_db(&created_at)?,
            })
        })
        .collect()
}
