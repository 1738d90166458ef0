//! Settings database operations
//!
//! Key/value runtime settings: lock-wait budget and per-firm pipeline
//! parameter overrides.

use doccat_common::{Error, Result};
use sqlx::{Pool, Sqlite};

/// Key of the lock-wait budget used by `retry_on_lock`
pub const MAX_LOCK_WAIT_KEY: &str = "db_max_lock_wait_ms";

/// Default lock-wait budget
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Maximum time a write waits on SQLite lock contention
///
/// **Default:** 5000 ms
pub async fn get_max_lock_wait_ms(db: &Pool<Sqlite>) -> Result<u64> {
    get_setting(db, MAX_LOCK_WAIT_KEY)
        .await
        .map(|opt| opt.unwrap_or(DEFAULT_MAX_LOCK_WAIT_MS))
}

pub async fn set_max_lock_wait_ms(db: &Pool<Sqlite>, value: u64) -> Result<()> {
    set_setting(db, MAX_LOCK_WAIT_KEY, value).await
}

fn firm_parameters_key(firm_id: &str) -> String {
    format!("firm.{}.parameters", firm_id)
}

/// Firm-level pipeline parameter override (partial JSON object)
pub async fn get_firm_parameters(
    db: &Pool<Sqlite>,
    firm_id: &str,
) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = get_setting(db, &firm_parameters_key(firm_id)).await?;
    raw.map(|value| {
        serde_json::from_str(&value)
            .map_err(|e| Error::Config(format!("Parse parameters for firm {} failed: {}", firm_id, e)))
    })
    .transpose()
}

/// Store a firm-level override; must be a JSON object
pub async fn set_firm_parameters(
    db: &Pool<Sqlite>,
    firm_id: &str,
    parameters: &serde_json::Value,
) -> Result<()> {
    if !parameters.is_object() {
        return Err(Error::InvalidInput(
            "firm parameter override must be a JSON object".to_string(),
        ));
    }
    set_setting(db, &firm_parameters_key(firm_id), parameters.to_string()).await
}

/// Generic setting getter
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting {} failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter (upsert)
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: ToString,
{
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_wait_default_and_override() {
        let db = crate::db::init_memory_database().await.unwrap();
        assert_eq!(get_max_lock_wait_ms(&db).await.unwrap(), DEFAULT_MAX_LOCK_WAIT_MS);

        set_max_lock_wait_ms(&db, 250).await.unwrap();
        assert_eq!(get_max_lock_wait_ms(&db).await.unwrap(), 250);
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let db = crate::db::init_memory_database().await.unwrap();
        set_setting(&db, MAX_LOCK_WAIT_KEY, "soon").await.unwrap();
        assert!(matches!(get_max_lock_wait_ms(&db).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_firm_parameters_round_trip() {
        let db = crate::db::init_memory_database().await.unwrap();
        assert!(get_firm_parameters(&db, "acme").await.unwrap().is_none());

        let overrides = serde_json::json!({
            "clustering": { "similarity_threshold": 0.7, "min_cluster_size": 2 }
        });
        set_firm_parameters(&db, "acme", &overrides).await.unwrap();
        assert_eq!(get_firm_parameters(&db, "acme").await.unwrap(), Some(overrides));

        assert!(set_firm_parameters(&db, "acme", &serde_json::json!([1, 2])).await.is_err());
    }
}
