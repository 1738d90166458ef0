//! doccat-ingest - document categorization microservice
//!
//! Takes the documents an external extractor registered for an import
//! session through triage, deduplication, embedding, clustering and naming,
//! then serves review batches and reviewer decisions until the approved
//! taxonomy is exported.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use doccat_common::config::{self, RootFolderInitializer, TomlConfig};
use doccat_common::events::EventBus;
use doccat_ingest::services::{FsBlobStore, HttpScoringClient};
use doccat_ingest::AppState;

const MODULE_NAME: &str = "doccat-ingest";

/// Command-line arguments for doccat-ingest
#[derive(Parser, Debug)]
#[command(name = "doccat-ingest")]
#[command(about = "Document categorization microservice")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "DOCCAT_PORT")]
    port: Option<u16>,

    /// Root folder for the database and default blob store
    #[arg(short, long, env = "DOCCAT_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// TOML bootstrap file
    #[arg(short, long, env = "DOCCAT_CONFIG")]
    config: Option<PathBuf>,
}

const DEFAULT_PORT: u16 = 5780;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_path(MODULE_NAME));
    let toml_config = config::load_toml_config(&config_path).context("Failed to load config")?;

    init_tracing(&toml_config)?;

    info!(
        "Starting {} v{} (git {}, built {} {})",
        MODULE_NAME,
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    // CLI and env are already merged by clap
    let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), "DOCCAT_ROOT_FOLDER", &toml_config);
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = doccat_ingest::db::init_database_pool(&db_path, 8).await?;

    let interrupted = doccat_ingest::db::sessions::cleanup_interrupted_sessions(&db_pool).await?;
    if interrupted > 0 {
        warn!(
            sessions = interrupted,
            "Sessions interrupted by the last shutdown were marked FAILED; resume them to continue"
        );
    }

    let blob_root = toml_config
        .storage
        .root
        .clone()
        .unwrap_or_else(|| initializer.blob_path());
    tokio::fs::create_dir_all(&blob_root)
        .await
        .with_context(|| format!("Failed to create blob store {}", blob_root.display()))?;
    info!("Blob store: {}", blob_root.display());
    let storage = Arc::new(FsBlobStore::new(blob_root));

    let scoring_url = doccat_ingest::config::resolve_scoring_base_url(&toml_config)?;
    let scoring = Arc::new(
        HttpScoringClient::new(
            &scoring_url,
            doccat_ingest::config::resolve_scoring_api_key(&toml_config),
            Duration::from_secs(toml_config.scoring.timeout_secs),
            toml_config.scoring.max_requests_per_second,
            toml_config.scoring.embedding_dimension,
        )
        .context("Failed to build scoring client")?,
    );
    info!("Scoring service: {}", scoring_url);

    let pipeline_defaults = doccat_ingest::config::toml_pipeline_defaults(&toml_config)?;

    let event_bus = EventBus::new(1000);
    let state = AppState::new(db_pool, event_bus, scoring, storage).with_pipeline_defaults(pipeline_defaults);
    let app = doccat_ingest::build_router(state);

    let port = args.port.or(toml_config.port).unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// `RUST_LOG` wins; otherwise the TOML `[logging] level`
fn init_tracing(toml_config: &TomlConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},tower_http=info,sqlx=warn",
            toml_config.logging.level
        ))
    });

    match &toml_config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
