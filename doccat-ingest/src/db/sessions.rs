//! Import session database operations
//!
//! Every state change is a compare-and-set keyed by session id: the UPDATE
//! only matches when the row is still in the expected state, and zero rows
//! affected is reported as a conflict carrying the state actually found.

use doccat_common::time::{from_db, from_db_opt, to_db};
use doccat_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::models::{ImportSession, PipelineParameters, PipelineState, Stage};
use crate::utils::retry_on_lock;

/// Conflict code for an edge that is not in the state machine or lost a race
pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";

/// Conflict code for reviewer operations outside READY_FOR_VALIDATION / RECLUSTERING
pub const SESSION_NOT_REVIEWABLE: &str = "SESSION_NOT_REVIEWABLE";

const SESSION_COLUMNS: &str = r#"
    session_id, firm_id, source_file_name, source_file_size, state,
    parameters, parameters_version, checkpoint, failed_stage, last_error,
    total_documents, reclassification_count, recluster_baseline,
    reclustering_rounds, started_at, completed_at, updated_at
"#;

/// Insert a new session row
pub async fn insert_session(pool: &SqlitePool, session: &ImportSession) -> Result<()> {
    let parameters = serde_json::to_string(&session.parameters)
        .map_err(|e| Error::Internal(format!("Failed to serialize parameters: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO import_sessions (
            session_id, firm_id, source_file_name, source_file_size, state,
            parameters, parameters_version, checkpoint, failed_stage, last_error,
            total_documents, reclassification_count, recluster_baseline,
            reclustering_rounds, started_at, completed_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.session_id.to_string())
    .bind(&session.firm_id)
    .bind(&session.source_file_name)
    .bind(session.source_file_size)
    .bind(session.state.as_str())
    .bind(parameters)
    .bind(session.parameters_version)
    .bind(session.checkpoint.map(|s| s.as_str()))
    .bind(session.failed_stage.map(|s| s.as_str()))
    .bind(&session.last_error)
    .bind(session.total_documents)
    .bind(session.reclassification_count)
    .bind(session.recluster_baseline)
    .bind(session.reclustering_rounds)
    .bind(to_db(session.started_at))
    .bind(session.completed_at.map(to_db))
    .bind(to_db(session.updated_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Load import session from database
pub async fn load_session(pool: &SqlitePool, session_id: Uuid) -> Result<Option<ImportSession>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM import_sessions WHERE session_id = ?",
        SESSION_COLUMNS
    ))
    .bind(session_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_session).transpose()
}

/// Load a session or fail with NotFound
pub async fn get_session(pool: &SqlitePool, session_id: Uuid) -> Result<ImportSession> {
    load_session(pool, session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Session {} not found", session_id)))
}

/// Sessions, newest first, optionally for one firm
pub async fn list_sessions(pool: &SqlitePool, firm_id: Option<&str>) -> Result<Vec<ImportSession>> {
    let rows = match firm_id {
        Some(firm) => {
            sqlx::query(&format!(
                "SELECT {} FROM import_sessions WHERE firm_id = ? ORDER BY started_at DESC",
                SESSION_COLUMNS
            ))
            .bind(firm)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM import_sessions ORDER BY started_at DESC",
                SESSION_COLUMNS
            ))
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(row_to_session).collect()
}

async fn current_state(conn: &mut SqliteConnection, session_id: Uuid) -> Result<Option<PipelineState>> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM import_sessions WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    state.map(|s| s.parse()).transpose()
}

/// Atomic `expected → target` transition on an open connection
///
/// `checkpoint` records the stage that just completed. Entering COMPLETED
/// stamps `completed_at`.
pub async fn compare_and_set_state_on(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    expected: PipelineState,
    target: PipelineState,
    checkpoint: Option<Stage>,
) -> Result<()> {
    if !expected.can_transition_to(target) || target == PipelineState::Failed {
        return Err(Error::conflict(
            INVALID_TRANSITION,
            format!("{} → {} is not a valid transition", expected, target),
        ));
    }

    let now = to_db(chrono::Utc::now());
    let completed_at = (target == PipelineState::Completed).then(|| now.clone());

    let result = sqlx::query(
        r#"
        UPDATE import_sessions
        SET state = ?,
            checkpoint = COALESCE(?, checkpoint),
            completed_at = ?,
            updated_at = ?
        WHERE session_id = ? AND state = ?
        "#,
    )
    .bind(target.as_str())
    .bind(checkpoint.map(|s| s.as_str()))
    .bind(completed_at)
    .bind(&now)
    .bind(session_id.to_string())
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(match current_state(conn, session_id).await? {
            None => Error::NotFound(format!("Session {} not found", session_id)),
            Some(actual) => Error::conflict(
                INVALID_TRANSITION,
                format!(
                    "Session {} is {}, expected {} for transition to {}",
                    session_id, actual, expected, target
                ),
            ),
        });
    }

    tracing::info!(
        session_id = %session_id,
        from = %expected,
        to = %target,
        "Session state transition"
    );

    Ok(())
}

/// Atomic `expected → target` transition
pub async fn compare_and_set_state(
    pool: &SqlitePool,
    session_id: Uuid,
    expected: PipelineState,
    target: PipelineState,
    checkpoint: Option<Stage>,
) -> Result<()> {
    let max_wait_ms = super::settings::get_max_lock_wait_ms(pool).await?;
    retry_on_lock("session state transition", max_wait_ms, || async {
        let mut conn = pool.acquire().await?;
        compare_and_set_state_on(&mut conn, session_id, expected, target, checkpoint).await
    })
    .await
}

/// Move a session from `expected` to FAILED, recording the stage and error
pub async fn mark_failed(
    pool: &SqlitePool,
    session_id: Uuid,
    expected: PipelineState,
    stage: Option<Stage>,
    error: &str,
) -> Result<()> {
    if !expected.can_transition_to(PipelineState::Failed) {
        return Err(Error::conflict(
            INVALID_TRANSITION,
            format!("{} → FAILED is not a valid transition", expected),
        ));
    }

    let now = to_db(chrono::Utc::now());
    let mut conn = pool.acquire().await?;
    let result = sqlx::query(
        r#"
        UPDATE import_sessions
        SET state = 'FAILED',
            failed_stage = ?,
            last_error = ?,
            completed_at = ?,
            updated_at = ?
        WHERE session_id = ? AND state = ?
        "#,
    )
    .bind(stage.map(|s| s.as_str()))
    .bind(error)
    .bind(&now)
    .bind(&now)
    .bind(session_id.to_string())
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(match current_state(&mut conn, session_id).await? {
            None => Error::NotFound(format!("Session {} not found", session_id)),
            Some(actual) => Error::conflict(
                INVALID_TRANSITION,
                format!("Session {} is {}, expected {}", session_id, actual, expected),
            ),
        });
    }

    tracing::error!(
        session_id = %session_id,
        from = %expected,
        stage = ?stage,
        error,
        "Session failed"
    );

    Ok(())
}

/// Re-enter the running state of the stage that failed
///
/// Returns the state the session was resumed into.
pub async fn resume_failed(pool: &SqlitePool, session_id: Uuid) -> Result<PipelineState> {
    let session = get_session(pool, session_id).await?;
    if session.state != PipelineState::Failed {
        return Err(Error::conflict(
            INVALID_TRANSITION,
            format!("Session {} is {}, only FAILED sessions can be resumed", session_id, session.state),
        ));
    }

    // Failed before any stage ran (operator cancelled a NOT_STARTED session)
    let stage = session.failed_stage.unwrap_or(Stage::Triage);
    let target = stage.running_state();

    let result = sqlx::query(
        r#"
        UPDATE import_sessions
        SET state = ?, failed_stage = NULL, completed_at = NULL, updated_at = ?
        WHERE session_id = ? AND state = 'FAILED'
        "#,
    )
    .bind(target.as_str())
    .bind(to_db(chrono::Utc::now()))
    .bind(session_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::conflict(
            INVALID_TRANSITION,
            format!("Session {} changed state while resuming", session_id),
        ));
    }

    tracing::info!(session_id = %session_id, to = %target, "Session resumed");
    Ok(target)
}

/// Fail sessions left in an automatic stage by a previous process
///
/// Their stage is recorded as `failed_stage` so an operator can resume them.
pub async fn cleanup_interrupted_sessions(pool: &SqlitePool) -> Result<u64> {
    let now = to_db(chrono::Utc::now());
    let result = sqlx::query(
        r#"
        UPDATE import_sessions
        SET failed_stage = CASE state
                WHEN 'TRIAGING' THEN 'TRIAGE'
                WHEN 'DEDUPLICATING' THEN 'DEDUPLICATE'
                WHEN 'EMBEDDING' THEN 'EMBED'
                WHEN 'CLUSTERING' THEN 'CLUSTER'
                WHEN 'NAMING' THEN 'NAME'
                WHEN 'RECLUSTERING' THEN 'RE_CLUSTER'
                WHEN 'EXTRACTING' THEN 'EXTRACT'
            END,
            state = 'FAILED',
            last_error = 'Interrupted by service restart',
            completed_at = ?,
            updated_at = ?
        WHERE state IN ('TRIAGING', 'DEDUPLICATING', 'EMBEDDING', 'CLUSTERING',
                        'NAMING', 'RECLUSTERING', 'EXTRACTING')
        "#,
    )
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    let count = result.rows_affected();
    if count > 0 {
        tracing::warn!(count, "Marked interrupted sessions as FAILED (resumable)");
    }
    Ok(count)
}

/// First write of a multi-row transaction: assert the session is in one of `allowed`
///
/// Starting the transaction with a write takes the database write lock
/// immediately, so later reads in the same transaction cannot go stale.
pub async fn guard_state_on(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    allowed: &[PipelineState],
    code: &'static str,
) -> Result<()> {
    let placeholders = vec!["?"; allowed.len()].join(", ");
    let sql = format!(
        "UPDATE import_sessions SET updated_at = ? WHERE session_id = ? AND state IN ({})",
        placeholders
    );

    let mut query = sqlx::query(&sql)
        .bind(to_db(chrono::Utc::now()))
        .bind(session_id.to_string());
    for state in allowed {
        query = query.bind(state.as_str());
    }

    if query.execute(&mut *conn).await?.rows_affected() == 0 {
        return Err(match current_state(conn, session_id).await? {
            None => Error::NotFound(format!("Session {} not found", session_id)),
            Some(actual) => Error::conflict(
                code,
                format!("Session {} is {}", session_id, actual),
            ),
        });
    }
    Ok(())
}

/// Guard for reviewer operations
pub async fn guard_reviewable_on(conn: &mut SqliteConnection, session_id: Uuid) -> Result<()> {
    guard_state_on(
        conn,
        session_id,
        &[PipelineState::ReadyForValidation, PipelineState::ReClustering],
        SESSION_NOT_REVIEWABLE,
    )
    .await
}

pub async fn set_total_documents_on(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    total: i64,
) -> Result<()> {
    sqlx::query("UPDATE import_sessions SET total_documents = ? WHERE session_id = ?")
        .bind(total)
        .bind(session_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Count one more reclassification
pub async fn increment_reclassifications_on(conn: &mut SqliteConnection, session_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE import_sessions SET reclassification_count = reclassification_count + 1 WHERE session_id = ?",
    )
    .bind(session_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// READY_FOR_VALIDATION → RECLUSTERING when pending reclassifications reach `trigger_count`
///
/// A single conditional update: the baseline is reset in the same statement,
/// so one crossing fires exactly once. Returns `(reclassification_count, round)`
/// when the transition happened.
pub async fn try_trigger_reclustering_on(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    trigger_count: i64,
) -> Result<Option<(i64, i64)>> {
    let row = sqlx::query(
        r#"
        UPDATE import_sessions
        SET state = 'RECLUSTERING',
            recluster_baseline = reclassification_count,
            reclustering_rounds = reclustering_rounds + 1,
            updated_at = ?
        WHERE session_id = ?
          AND state = 'READY_FOR_VALIDATION'
          AND reclassification_count - recluster_baseline >= ?
        RETURNING reclassification_count, reclustering_rounds
        "#,
    )
    .bind(to_db(chrono::Utc::now()))
    .bind(session_id.to_string())
    .bind(trigger_count)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|r| (r.get::<i64, _>(0), r.get::<i64, _>(1))))
}

fn row_to_session(row: &SqliteRow) -> Result<ImportSession> {
    let session_id: String = row.try_get("session_id")?;
    let session_id = Uuid::parse_str(&session_id)
        .map_err(|e| Error::Internal(format!("Invalid session id {}: {}", session_id, e)))?;

    let state: String = row.try_get("state")?;
    let parameters: String = row.try_get("parameters")?;
    let parameters: PipelineParameters = serde_json::from_str(&parameters)
        .map_err(|e| Error::Internal(format!("Failed to deserialize parameters: {}", e)))?;

    let checkpoint: Option<String> = row.try_get("checkpoint")?;
    let failed_stage: Option<String> = row.try_get("failed_stage")?;
    let started_at: String = row.try_get("started_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ImportSession {
        session_id,
        firm_id: row.try_get("firm_id")?,
        source_file_name: row.try_get("source_file_name")?,
        source_file_size: row.try_get("source_file_size")?,
        state: state.parse()?,
        parameters,
        parameters_version: row.try_get("parameters_version")?,
        checkpoint: checkpoint.map(|s| s.parse()).transpose()?,
        failed_stage: failed_stage.map(|s| s.parse()).transpose()?,
        last_error: row.try_get("last_error")?,
        total_documents: row.try_get("total_documents")?,
        reclassification_count: row.try_get("reclassification_count")?,
        recluster_baseline: row.try_get("recluster_baseline")?,
        reclustering_rounds: row.try_get("reclustering_rounds")?,
        started_at: from_db(&started_at)?,
        completed_at: from_db_opt(row.try_get("completed_at")?)?,
        updated_at: from_db(&updated_at)?,
    })
}
