//! Batch database operations
//!
//! Claims and releases are conditional updates on the batch row, so any
//! number of concurrent reviewers can call them without an external lock:
//! a batch row is only ever taken by the update that still sees it free.

use chrono::{DateTime, Datelike, Utc};
use doccat_common::events::ReclaimReason;
use doccat_common::time::{from_db, from_db_opt, to_db};
use doccat_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::documents::parse_uuid;
use crate::models::{Batch, BatchAssignment, SessionProgress};

/// Sort key for documents without a received date (sorts after every month)
pub const UNDATED_SORT_KEY: &str = "undated";

const BATCH_COLUMNS: &str = r#"
    id, session_id, sort_key, ordinal, member_count, categorized_count,
    skipped_count, assigned_to, assigned_at, last_activity_at, created_at
"#;

/// Calendar-month sort key of a received date
pub fn month_key(received_at: Option<DateTime<Utc>>) -> String {
    match received_at {
        Some(ts) => format!("{:04}-{:02}", ts.year(), ts.month()),
        None => UNDATED_SORT_KEY.to_string(),
    }
}

/// Partition unbatched canonical documents into immutable batches
///
/// Documents that failed a stage are left out. Documents are grouped by the calendar month they were received and each
/// month is chunked into `batch_size` pieces. Also recomputes the session's
/// `total_documents` as the number of batched (reviewable) documents.
/// Returns the batches created by this call.
pub async fn create_batches_on(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    batch_size: usize,
) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
    }

    let rows = sqlx::query(
        r#"
        SELECT id, received_at FROM documents
        WHERE session_id = ? AND is_canonical = 1 AND batch_id IS NULL AND deleted = 0
          AND stage_error IS NULL
        ORDER BY received_at IS NULL, received_at, extracted_at, id
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    // Group by month preserving order
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for row in &rows {
        let id: String = row.try_get("id")?;
        let key = month_key(from_db_opt(row.try_get("received_at")?)?);
        match groups.last_mut() {
            Some((last_key, members)) if *last_key == key => members.push(id),
            _ => groups.push((key, vec![id])),
        }
    }

    let now = Utc::now();
    let mut created = Vec::new();
    for (sort_key, members) in groups {
        // Continue numbering after batches from an earlier call
        let next_ordinal: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM batches WHERE session_id = ? AND sort_key = ?",
        )
        .bind(session_id.to_string())
        .bind(&sort_key)
        .fetch_one(&mut *conn)
        .await?;

        for (offset, chunk) in members.chunks(batch_size).enumerate() {
            let batch = Batch {
                id: Uuid::new_v4(),
                session_id,
                sort_key: sort_key.clone(),
                ordinal: next_ordinal + offset as i64,
                member_count: chunk.len() as i64,
                categorized_count: 0,
                skipped_count: 0,
                assignment: None,
                created_at: now,
            };

            sqlx::query(
                r#"
                INSERT INTO batches (id, session_id, sort_key, ordinal, member_count, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(batch.id.to_string())
            .bind(session_id.to_string())
            .bind(&batch.sort_key)
            .bind(batch.ordinal)
            .bind(batch.member_count)
            .bind(to_db(now))
            .execute(&mut *conn)
            .await?;

            for doc_id in chunk {
                sqlx::query("UPDATE documents SET batch_id = ? WHERE id = ? AND batch_id IS NULL")
                    .bind(batch.id.to_string())
                    .bind(doc_id)
                    .execute(&mut *conn)
                    .await?;
            }

            created.push(batch);
        }
    }

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM documents WHERE session_id = ? AND batch_id IS NOT NULL",
    )
    .bind(session_id.to_string())
    .fetch_one(&mut *conn)
    .await?;
    super::sessions::set_total_documents_on(conn, session_id, total).await?;

    tracing::info!(
        session_id = %session_id,
        batches_created = created.len(),
        total_documents = total,
        "Review batches created"
    );

    Ok(created)
}

pub async fn get_batch(pool: &SqlitePool, id: Uuid) -> Result<Batch> {
    let row = sqlx::query(&format!("SELECT {} FROM batches WHERE id = ?", BATCH_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref()
        .map(row_to_batch)
        .transpose()?
        .ok_or_else(|| Error::NotFound(format!("Batch {} not found", id)))
}

pub async fn get_batch_on(conn: &mut SqliteConnection, id: Uuid) -> Result<Batch> {
    let row = sqlx::query(&format!("SELECT {} FROM batches WHERE id = ?", BATCH_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref()
        .map(row_to_batch)
        .transpose()?
        .ok_or_else(|| Error::NotFound(format!("Batch {} not found", id)))
}

/// All batches of a session in allocation order
pub async fn list_for_session(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<Batch>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM batches WHERE session_id = ? ORDER BY sort_key, ordinal",
        BATCH_COLUMNS
    ))
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_batch).collect()
}

/// Unfinished batches currently held by `user_id`
pub async fn list_held_by(pool: &SqlitePool, session_id: Uuid, user_id: &str) -> Result<Vec<Batch>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM batches
        WHERE session_id = ? AND assigned_to = ?
          AND categorized_count + skipped_count < member_count
        ORDER BY sort_key, ordinal
        "#,
        BATCH_COLUMNS
    ))
    .bind(session_id.to_string())
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_batch).collect()
}

/// Claim the first free, unfinished batch in stable order
///
/// One statement: the row is picked and assigned only if it is still free
/// and `user_id` holds fewer than `cap` unfinished batches when the update
/// applies. `None` when nothing is left to claim or the cap is reached.
pub async fn claim_next_batch(
    pool: &SqlitePool,
    session_id: Uuid,
    user_id: &str,
    cap: usize,
    now: DateTime<Utc>,
) -> Result<Option<Batch>> {
    let now = to_db(now);
    let row = sqlx::query(&format!(
        r#"
        UPDATE batches
        SET assigned_to = ?, assigned_at = ?, last_activity_at = ?
        WHERE id = (
            SELECT id FROM batches
            WHERE session_id = ?
              AND assigned_to IS NULL
              AND categorized_count + skipped_count < member_count
            ORDER BY sort_key, ordinal
            LIMIT 1
        )
        AND assigned_to IS NULL
        AND (
            SELECT COUNT(*) FROM batches
            WHERE session_id = ? AND assigned_to = ?
              AND categorized_count + skipped_count < member_count
        ) < ?
        RETURNING {}
        "#,
        BATCH_COLUMNS
    ))
    .bind(user_id)
    .bind(&now)
    .bind(&now)
    .bind(session_id.to_string())
    .bind(session_id.to_string())
    .bind(user_id)
    .bind(cap as i64)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_batch).transpose()
}

/// A released assignment
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedAssignment {
    pub batch_id: Uuid,
    pub previous_owner: String,
    pub reason: ReclaimReason,
}

/// Release assignments idle since before `idle_cutoff`, or whose batch is finished
///
/// Each release is a conditional update on the (batch, owner) pair it was
/// selected with, so a concurrent claim or activity update wins cleanly.
pub async fn release_stale_assignments(
    pool: &SqlitePool,
    session_id: Uuid,
    idle_cutoff: DateTime<Utc>,
) -> Result<Vec<ReleasedAssignment>> {
    let cutoff = to_db(idle_cutoff);
    let candidates = sqlx::query(
        r#"
        SELECT id, assigned_to,
               categorized_count + skipped_count >= member_count AS finished
        FROM batches
        WHERE session_id = ? AND assigned_to IS NOT NULL
          AND (last_activity_at < ? OR categorized_count + skipped_count >= member_count)
        ORDER BY sort_key, ordinal
        "#,
    )
    .bind(session_id.to_string())
    .bind(&cutoff)
    .fetch_all(pool)
    .await?;

    let mut released = Vec::new();
    for row in candidates {
        let id: String = row.try_get("id")?;
        let owner: String = row.try_get("assigned_to")?;
        let finished: bool = row.try_get("finished")?;

        let result = sqlx::query(
            r#"
            UPDATE batches
            SET assigned_to = NULL, assigned_at = NULL, last_activity_at = NULL
            WHERE id = ? AND assigned_to = ?
              AND (last_activity_at < ? OR categorized_count + skipped_count >= member_count)
            "#,
        )
        .bind(&id)
        .bind(&owner)
        .bind(&cutoff)
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            released.push(ReleasedAssignment {
                batch_id: parse_uuid(&id)?,
                previous_owner: owner,
                reason: if finished {
                    ReclaimReason::Finished
                } else {
                    ReclaimReason::Idle
                },
            });
        }
    }

    Ok(released)
}

/// Refresh the owner's activity timestamp (no-op for anyone else)
pub async fn touch_activity_on(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query("UPDATE batches SET last_activity_at = ? WHERE id = ? AND assigned_to = ?")
        .bind(to_db(now))
        .bind(batch_id.to_string())
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Apply counter deltas in place (never read-modify-write)
pub async fn adjust_counters_on(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    categorized_delta: i64,
    skipped_delta: i64,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE batches
        SET categorized_count = categorized_count + ?,
            skipped_count = skipped_count + ?
        WHERE id = ?
        "#,
    )
    .bind(categorized_delta)
    .bind(skipped_delta)
    .bind(batch_id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Batch {} not found", batch_id)));
    }
    Ok(())
}

/// Session-wide counters from a single statement (one consistent snapshot)
pub async fn session_progress(pool: &SqlitePool, session_id: Uuid) -> Result<SessionProgress> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT total_documents FROM import_sessions WHERE session_id = ?1) AS total,
            (SELECT COALESCE(SUM(categorized_count), 0) FROM batches WHERE session_id = ?1) AS categorized,
            (SELECT COALESCE(SUM(skipped_count), 0) FROM batches WHERE session_id = ?1) AS skipped,
            (SELECT COUNT(*) FROM documents
                WHERE session_id = ?1 AND batch_id IS NOT NULL AND review_outcome IS NULL) AS remaining,
            (SELECT COUNT(*) FROM documents WHERE session_id = ?1 AND is_canonical = 0) AS duplicates,
            (SELECT COUNT(*) FROM batches WHERE session_id = ?1) AS batches_total,
            (SELECT COUNT(*) FROM batches
                WHERE session_id = ?1 AND assigned_to IS NOT NULL) AS batches_assigned,
            (SELECT COUNT(*) FROM batches
                WHERE session_id = ?1 AND categorized_count + skipped_count >= member_count) AS batches_completed
        "#,
    )
    .bind(session_id.to_string())
    .fetch_one(pool)
    .await?;

    let total: Option<i64> = row.try_get("total")?;
    Ok(SessionProgress {
        total: total.ok_or_else(|| Error::NotFound(format!("Session {} not found", session_id)))?,
        categorized: row.try_get("categorized")?,
        skipped: row.try_get("skipped")?,
        remaining: row.try_get("remaining")?,
        duplicates: row.try_get("duplicates")?,
        batches_total: row.try_get("batches_total")?,
        batches_assigned: row.try_get("batches_assigned")?,
        batches_completed: row.try_get("batches_completed")?,
    })
}

fn row_to_batch(row: &SqliteRow) -> Result<Batch> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    let created_at: String = row.try_get("created_at")?;
    let assigned_to: Option<String> = row.try_get("assigned_to")?;
    let assigned_at = from_db_opt(row.try_get("assigned_at")?)?;
    let last_activity_at = from_db_opt(row.try_get("last_activity_at")?)?;

    let assignment = match (assigned_to, assigned_at) {
        (Some(user_id), Some(assigned_at)) => Some(BatchAssignment {
            user_id,
            assigned_at,
            last_activity_at: last_activity_at.unwrap_or(assigned_at),
        }),
        _ => None,
    };

    Ok(Batch {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        sort_key: row.try_get("sort_key")?,
        ordinal: row.try_get("ordinal")?,
        member_count: row.try_get("member_count")?,
        categorized_count: row.try_get("categorized_count")?,
        skipped_count: row.try_get("skipped_count")?,
        assignment,
        created_at: from_db(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_month_key() {
        let ts = Utc.with_ymd_and_hms(2023, 7, 14, 8, 0, 0).unwrap();
        assert_eq!(month_key(Some(ts)), "2023-07");
        assert_eq!(month_key(None), UNDATED_SORT_KEY);
        assert!("2023-07".to_string() < month_key(None));
    }
}
