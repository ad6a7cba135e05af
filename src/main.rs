use anyhow::{Result, bail};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    blob_store::BlobStore,
    clock::SystemClock,
    conversion::{ConversionCache, ImageTranscoder},
    id_allocator::IdAllocator,
    metadata_store::SqliteMetadataStore,
    reconciler::Reconciler,
    storage_service::{IngestLimits, StorageService},
    sweeper::ExpirySweeper,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting dropstore with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    ensure_dir(&cfg.upload_dir)?;
    ensure_dir(&cfg.cache_dir)?;

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let options = SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true);

    // Create parent directory if needed
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    let metadata = Arc::new(SqliteMetadataStore::new(db.clone()));
    metadata.migrate().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let blobs = BlobStore::new(&cfg.upload_dir);
    let cache = ConversionCache::new(
        &cfg.cache_dir,
        cfg.max_convertible_size,
        cfg.max_upload_size,
        Arc::new(ImageTranscoder),
    );
    let clock = Arc::new(SystemClock);
    let storage = StorageService::new(
        metadata.clone(),
        blobs.clone(),
        cache.clone(),
        IdAllocator::new(&cfg.id_alphabet, cfg.id_length),
        clock.clone(),
        IngestLimits {
            ttl: cfg.ttl(),
            max_upload_size: cfg.max_upload_size,
        },
    );

    // --- Heal divergence left by a previous crash ---
    Reconciler::new(metadata.clone(), blobs.clone(), cache.clone())
        .run()
        .await?;

    let sweeper = Arc::new(ExpirySweeper::new(
        metadata,
        blobs,
        cache,
        clock,
        cfg.sweep_interval(),
    ))
    .start();

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Create `path` if missing; refuse to start if it is something else.
fn ensure_dir(path: &str) -> Result<()> {
    let dir = Path::new(path);
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        tracing::info!("Created storage directory at {}", path);
    } else if !dir.is_dir() {
        bail!("\"{}\" is not a directory", path);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
