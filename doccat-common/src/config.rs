//! Bootstrap configuration loading and root folder resolution
//!
//! Bootstrap settings come from a TOML file; everything that may change at
//! runtime lives in the database `settings` table instead.
//!
//! Resolution priority for every bootstrap value:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "doccat.db";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Root folder for the database and default blob store
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// HTTP port
    #[serde(default)]
    pub port: Option<u16>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Scoring collaborator endpoint
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Blob store location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Default pipeline parameters (service-specific schema)
    #[serde(default)]
    pub pipeline: Option<toml::Value>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Scoring collaborator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringConfig {
    /// Base URL of the triage/embedding/naming service
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_scoring_timeout_secs")]
    pub timeout_secs: u64,

    /// Client-side request rate cap
    #[serde(default)]
    pub max_requests_per_second: Option<u32>,

    /// Expected embedding length; learned from the first vector when unset
    #[serde(default)]
    pub embedding_dimension: Option<usize>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: default_scoring_timeout_secs(),
            max_requests_per_second: None,
            embedding_dimension: None,
        }
    }
}

/// Blob store configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory backing the filesystem blob store (default: `<root>/blobs`)
    #[serde(default)]
    pub root: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scoring_timeout_secs() -> u64 {
    30
}

/// Load the TOML bootstrap file
///
/// A missing file is not an error: a warning is logged and defaults are used.
/// A present but malformed file is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Default path of a module's TOML file (`~/.config/doccat/<module>.toml`)
pub fn default_config_path(module_name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("doccat")
        .join(format!("{}.toml", module_name))
}

/// Resolve the root folder following the bootstrap priority order
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_config: &TomlConfig,
) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("doccat"))
        .unwrap_or_else(|| PathBuf::from("./doccat_data"))
}

/// Creates the root folder layout on first run
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    /// Create the root folder if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// Path of the SQLite database inside the root folder
    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }

    /// Default blob store directory inside the root folder
    pub fn blob_path(&self) -> PathBuf {
        self.root_folder.join("blobs")
    }
}
