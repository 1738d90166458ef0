//! Database initialization
//!
//! Opens the SQLite pool with the pragmas every doccat service relies on and
//! creates the tables shared by all services.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Default busy timeout applied to every pooled connection
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Open (creating if needed) the database at `db_path`
///
/// Pragmas are set through connect options so they apply to every pooled
/// connection, not just the first one.
pub async fn open_pool(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema_version_table(&pool).await?;
    create_settings_table(&pool).await?;

    Ok(pool)
}

/// Open a private in-memory database (tests, dry runs)
///
/// Limited to a single connection: every SQLite `:memory:` connection is a
/// separate database.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    create_schema_version_table(&pool).await?;
    create_settings_table(&pool).await?;

    Ok(pool)
}

/// Create schema_version table
pub async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            component TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create settings key/value table
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the schema version a component has applied
pub async fn record_schema_version(pool: &SqlitePool, component: &str, version: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO schema_version (component, version, applied_at) VALUES (?, ?, ?)
        ON CONFLICT(component) DO UPDATE SET
            version = excluded.version,
            applied_at = excluded.applied_at
        "#,
    )
    .bind(component)
    .bind(version)
    .bind(crate::time::to_db(crate::time::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Read the schema version a component has applied (None if never applied)
pub async fn schema_version(pool: &SqlitePool, component: &str) -> Result<Option<i64>> {
    let version = sqlx::query_scalar("SELECT version FROM schema_version WHERE component = ?")
        .bind(component)
        .fetch_optional(pool)
        .await?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pool_has_shared_tables() {
        let pool = open_memory_pool().await.unwrap();
        assert_eq!(schema_version(&pool, "doccat-ingest").await.unwrap(), None);

        record_schema_version(&pool, "doccat-ingest", 1).await.unwrap();
        record_schema_version(&pool, "doccat-ingest", 2).await.unwrap();
        assert_eq!(schema_version(&pool, "doccat-ingest").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_file_pool_creates_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("doccat.db");

        let pool = open_pool(&db_path, 4).await.unwrap();
        assert!(db_path.exists());

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
