//! Configuration resolution for doccat-ingest
//!
//! Two concerns live here:
//! - scoring collaborator endpoint and key (ENV → TOML)
//! - per-session pipeline parameters (request → firm override → TOML → defaults)

use doccat_common::config::TomlConfig;
use doccat_common::{Error, Result};
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, warn};

use crate::models::PipelineParameters;

/// Environment override for the scoring service URL
pub const SCORING_URL_ENV: &str = "DOCCAT_SCORING_URL";

/// Environment override for the scoring service key
pub const SCORING_API_KEY_ENV: &str = "DOCCAT_SCORING_API_KEY";

/// Resolve the scoring service base URL
///
/// **Priority:** ENV → TOML. No URL is a configuration error.
pub fn resolve_scoring_base_url(toml_config: &TomlConfig) -> Result<String> {
    let env_url = std::env::var(SCORING_URL_ENV)
        .ok()
        .filter(|u| !u.trim().is_empty());
    let toml_url = toml_config
        .scoring
        .base_url
        .clone()
        .filter(|u| !u.trim().is_empty());

    if env_url.is_some() && toml_url.is_some() {
        warn!(
            "Scoring URL found in environment and TOML. Using environment ({}).",
            SCORING_URL_ENV
        );
    }

    if let Some(url) = env_url {
        info!("Scoring URL loaded from environment");
        return Ok(url);
    }
    if let Some(url) = toml_url {
        info!("Scoring URL loaded from TOML config");
        return Ok(url);
    }

    Err(Error::Config(format!(
        "Scoring service URL not configured. Set {} or [scoring] base_url in the TOML file.",
        SCORING_URL_ENV
    )))
}

/// Resolve the scoring service key (optional)
pub fn resolve_scoring_api_key(toml_config: &TomlConfig) -> Option<String> {
    std::env::var(SCORING_API_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| toml_config.scoring.api_key.clone())
        .filter(|k| !k.trim().is_empty())
}

/// `[pipeline]` table of the TOML file as JSON, for layering
pub fn toml_pipeline_defaults(toml_config: &TomlConfig) -> Result<Option<Value>> {
    toml_config
        .pipeline
        .as_ref()
        .map(|table| {
            let value = serde_json::to_value(table)
                .map_err(|e| Error::Config(format!("Invalid [pipeline] section: {}", e)))?;
            if !value.is_object() {
                return Err(Error::Config("[pipeline] must be a table".to_string()));
            }
            Ok(value)
        })
        .transpose()
}

/// Resolve the parameters a new session is frozen with
///
/// Layers, lowest first: built-in defaults, TOML `[pipeline]`, firm override
/// stored in settings, request body. Objects merge key by key, so a layer
/// only replaces what it names. The result is validated; a missing
/// clustering policy is an input error.
pub async fn resolve_session_parameters(
    db: &Pool<Sqlite>,
    firm_id: &str,
    toml_pipeline: Option<&Value>,
    request: Option<&Value>,
) -> Result<PipelineParameters> {
    let mut merged = serde_json::to_value(PipelineParameters::default())
        .map_err(|e| Error::Internal(format!("Serialize default parameters: {}", e)))?;

    if let Some(layer) = toml_pipeline {
        merge_json(&mut merged, layer);
    }

    if let Some(layer) = crate::db::settings::get_firm_parameters(db, firm_id).await? {
        debug!(firm_id, "Applying firm parameter override");
        merge_json(&mut merged, &layer);
    }

    if let Some(layer) = request {
        if !layer.is_object() {
            return Err(Error::InvalidInput("parameters must be a JSON object".to_string()));
        }
        merge_json(&mut merged, layer);
    }

    let parameters: PipelineParameters = serde_json::from_value(merged)
        .map_err(|e| Error::InvalidInput(format!("Invalid pipeline parameters: {}", e)))?;
    parameters.validate()?;
    Ok(parameters)
}

/// Overlay `layer` onto `base`; nested objects merge, everything else replaces
fn merge_json(base: &mut Value, layer: &Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, layer) => *base = layer.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    #[test]
    fn test_merge_json_is_key_by_key() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}, "keep": true});
        merge_json(&mut base, &json!({"a": 2, "nested": {"y": 3}}));
        assert_eq!(base, json!({"a": 2, "nested": {"x": 1, "y": 3}, "keep": true}));
    }

    #[tokio::test]
    async fn test_layers_apply_in_priority_order() {
        let pool = crate::db::init_memory_database().await.unwrap();
        let toml_layer = json!({
            "clustering": {"similarity_threshold": 0.8, "min_cluster_size": 3},
            "batch_size": 10,
            "sample_size": 7,
        });
        crate::db::settings::set_firm_parameters(&pool, "acme", &json!({"batch_size": 20}))
            .await
            .unwrap();

        let params = resolve_session_parameters(
            &pool,
            "acme",
            Some(&toml_layer),
            Some(&json!({"sample_size": 3})),
        )
        .await
        .unwrap();

        assert_eq!(params.batch_size, 20);
        assert_eq!(params.sample_size, 3);
        assert_eq!(params.clustering.unwrap().min_cluster_size, 3);
        assert_eq!(params.idle_reclaim_secs, 1800);

        // Other firms do not see the override
        let other = resolve_session_parameters(&pool, "globex", Some(&toml_layer), None)
            .await
            .unwrap();
        assert_eq!(other.batch_size, 10);
    }

    #[tokio::test]
    async fn test_missing_clustering_policy_is_rejected() {
        let pool = crate::db::init_memory_database().await.unwrap();
        let err = resolve_session_parameters(&pool, "acme", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    #[serial]
    fn test_scoring_url_env_wins_over_toml() {
        let mut toml_config = TomlConfig::default();
        toml_config.scoring.base_url = Some("http://toml:9000".to_string());

        std::env::set_var(SCORING_URL_ENV, "http://env:9000");
        assert_eq!(resolve_scoring_base_url(&toml_config).unwrap(), "http://env:9000");

        std::env::remove_var(SCORING_URL_ENV);
        assert_eq!(resolve_scoring_base_url(&toml_config).unwrap(), "http://toml:9000");

        assert!(resolve_scoring_base_url(&TomlConfig::default()).is_err());
    }
}
