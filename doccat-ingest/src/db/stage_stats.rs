//! Per-stage statistics persistence
//!
//! One row per (session, stage). A stage re-run (resume, reclustering round)
//! overwrites its own row and never touches another stage's.

use doccat_common::time::{from_db, from_db_opt, to_db};
use doccat_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Stage, StageStats, StageStatus};

/// Counters reported when a stage ends
#[derive(Debug, Clone, Default)]
pub struct StageSummary {
    pub documents_in: i64,
    pub documents_out: i64,
    pub failed_documents: i64,
    pub skipped_documents: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub details: serde_json::Value,
}

/// Mark a stage as running (resets its counters)
pub async fn begin(pool: &SqlitePool, session_id: Uuid, stage: Stage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stage_stats (session_id, stage, status, started_at)
        VALUES (?, ?, 'RUNNING', ?)
        ON CONFLICT(session_id, stage) DO UPDATE SET
            status = 'RUNNING',
            documents_in = 0,
            documents_out = 0,
            failed_documents = 0,
            skipped_documents = 0,
            error_count = 0,
            started_at = excluded.started_at,
            finished_at = NULL,
            last_error = NULL,
            details = '{}'
        "#,
    )
    .bind(session_id.to_string())
    .bind(stage.as_str())
    .bind(to_db(chrono::Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}

async fn write_end(
    pool: &SqlitePool,
    session_id: Uuid,
    stage: Stage,
    status: StageStatus,
    summary: &StageSummary,
) -> Result<()> {
    let details = if summary.details.is_null() {
        "{}".to_string()
    } else {
        summary.details.to_string()
    };

    let result = sqlx::query(
        r#"
        UPDATE stage_stats
        SET status = ?, documents_in = ?, documents_out = ?, failed_documents = ?,
            skipped_documents = ?, error_count = ?, finished_at = ?, last_error = ?,
            details = ?
        WHERE session_id = ? AND stage = ?
        "#,
    )
    .bind(status.as_str())
    .bind(summary.documents_in)
    .bind(summary.documents_out)
    .bind(summary.failed_documents)
    .bind(summary.skipped_documents)
    .bind(summary.error_count)
    .bind(to_db(chrono::Utc::now()))
    .bind(&summary.last_error)
    .bind(details)
    .bind(session_id.to_string())
    .bind(stage.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Internal(format!(
            "Stage {} for session {} was never started",
            stage, session_id
        )));
    }
    Ok(())
}

/// Record a successful stage
pub async fn finish(pool: &SqlitePool, session_id: Uuid, stage: Stage, summary: &StageSummary) -> Result<()> {
    write_end(pool, session_id, stage, StageStatus::Succeeded, summary).await
}

/// Record a stage-wide failure
pub async fn fail(pool: &SqlitePool, session_id: Uuid, stage: Stage, summary: &StageSummary) -> Result<()> {
    write_end(pool, session_id, stage, StageStatus::Failed, summary).await
}

/// All stage rows of a session, in pipeline order
pub async fn list_for_session(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<StageStats>> {
    let rows = sqlx::query(
        r#"
        SELECT stage, status, documents_in, documents_out, failed_documents,
               skipped_documents, error_count, started_at, finished_at, last_error, details
        FROM stage_stats
        WHERE session_id = ?
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut stats = Vec::with_capacity(rows.len());
    for row in rows {
        let stage: String = row.try_get("stage")?;
        let status: String = row.try_get("status")?;
        let started_at: String = row.try_get("started_at")?;
        let details: String = row.try_get("details")?;

        stats.push(StageStats {
            stage: stage.parse()?,
            status: StageStatus::parse(&status)
                .ok_or_else(|| Error::Internal(format!("Unknown stage status: {}", status)))?,
            documents_in: row.try_get("documents_in")?,
            documents_out: row.try_get("documents_out")?,
            failed_documents: row.try_get("failed_documents")?,
            skipped_documents: row.try_get("skipped_documents")?,
            error_count: row.try_get("error_count")?,
            started_at: from_db(&started_at)?,
            finished_at: from_db_opt(row.try_get("finished_at")?)?,
            last_error: row.try_get("last_error")?,
            details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        });
    }

    stats.sort_by_key(|s| Stage::ALL.iter().position(|stage| *stage == s.stage));
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImportSession, PipelineParameters};

    #[tokio::test]
    async fn test_stages_keep_independent_rows() {
        let pool = crate::db::init_memory_database().await.unwrap();
        let session = ImportSession::new("acme".into(), "a.zip".into(), 1, PipelineParameters::default());
        crate::db::sessions::insert_session(&pool, &session).await.unwrap();
        let id = session.session_id;

        begin(&pool, id, Stage::Triage).await.unwrap();
        finish(
            &pool,
            id,
            Stage::Triage,
            &StageSummary {
                documents_in: 50,
                documents_out: 47,
                failed_documents: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        begin(&pool, id, Stage::Deduplicate).await.unwrap();
        fail(
            &pool,
            id,
            Stage::Deduplicate,
            &StageSummary {
                documents_in: 47,
                last_error: Some("storage unreachable".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let stats = list_for_session(&pool, id).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].stage, Stage::Triage);
        assert_eq!(stats[0].status, StageStatus::Succeeded);
        assert_eq!(stats[0].failed_documents, 3);
        assert_eq!(stats[1].status, StageStatus::Failed);
        assert_eq!(stats[1].last_error.as_deref(), Some("storage unreachable"));

        // Resume re-runs only its own row
        begin(&pool, id, Stage::Deduplicate).await.unwrap();
        let stats = list_for_session(&pool, id).await.unwrap();
        assert_eq!(stats[0].documents_out, 47);
        assert_eq!(stats[1].status, StageStatus::Running);
        assert!(stats[1].last_error.is_none());
    }

    #[tokio::test]
    async fn test_finish_without_begin_is_internal_error() {
        let pool = crate::db::init_memory_database().await.unwrap();
        let err = finish(&pool, Uuid::new_v4(), Stage::Embed, &StageSummary::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
