use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod assembler;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod processor;
pub mod status;
pub mod storage;
pub mod sweeper;

use assembler::ChunkAssembler;
use auth::{ApiKeyCapabilities, ApiKeyRegistry, SessionRegistry};
use config::Config;
use database::setup_database;
use error::{AppError, Result};
use gate::DownloadGate;
use processor::UploadProcessor;
use status::StatusBoard;
use storage::{BucketStorage, LocalStorage, StorageRouter};
use sweeper::ExpirySweeper;

// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Config,
    pub assembler: Arc<ChunkAssembler>,
    pub storage: Arc<StorageRouter>,
    pub status: Arc<StatusBoard>,
    pub processor: Arc<UploadProcessor>,
    pub gate: Arc<DownloadGate>,
    pub sessions: Arc<SessionRegistry>,
    pub api_keys: Arc<ApiKeyRegistry>,
}

pub async fn run_server() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;

    // Setup database
    let db = setup_database(&config.database_url).await?;

    // Setup storage backends
    let local = LocalStorage::new(&config.storage_dir);
    local.init().await?;

    let mut storage = StorageRouter::new(local);
    if let Some(bucket_name) = &config.bucket_name {
        let bucket = BucketStorage::new(
            bucket_name.clone(),
            config.bucket_region.clone(),
            config.bucket_endpoint.clone(),
        )
        .await?;
        storage = storage.with_bucket(bucket_name.clone(), bucket);
        tracing::info!("🪣 Remote bucket configured: {}", bucket_name);
    }
    let storage = Arc::new(storage);

    // Setup chunk staging
    let assembler = Arc::new(ChunkAssembler::new(
        &config.storage_dir,
        config.staging_capacity,
    ));
    assembler.init().await?;

    let status = Arc::new(StatusBoard::new());

    let processor = Arc::new(UploadProcessor::new(
        db.clone(),
        assembler.clone(),
        storage.clone(),
        status.clone(),
    ));

    let sessions = Arc::new(SessionRegistry::new());
    let api_keys = Arc::new(ApiKeyRegistry::new());
    for key in &config.api_keys {
        api_keys.insert(key.clone(), 0, ApiKeyCapabilities::full());
    }

    let grace = chrono::Duration::seconds(config.deletion_grace_secs);
    let gate = Arc::new(DownloadGate::new(
        db.clone(),
        storage.clone(),
        sessions.clone(),
        api_keys.clone(),
        grace,
    ));

    // Expiry sweeper runs for the life of the process
    let sweeper = Arc::new(ExpirySweeper::new(
        db.clone(),
        storage.clone(),
        assembler.clone(),
        status.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        grace,
        Duration::from_secs(config.session_idle_secs),
    ));
    sweeper.spawn();

    // Extract config values before moving state
    let server_address = config.server_address.clone();
    let storage_dir = config.storage_dir.clone();

    let state = AppState {
        db,
        config,
        assembler,
        storage,
        status,
        processor,
        gate,
        sessions,
        api_keys,
    };

    // Build the application router
    let app = create_app(state);

    // Create TCP listener
    let listener = tokio::net::TcpListener::bind(&server_address)
        .await
        .map_err(|e| {
            AppError::ServerError(format!("Failed to bind to {}: {}", server_address, e))
        })?;

    tracing::info!("🚀 Beppu backend server starting on {}", server_address);
    tracing::info!("📁 File storage directory: {}", storage_dir);

    // Start the server
    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::ServerError(format!("Server error: {}", e)))?;

    Ok(())
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Chunked upload operations
        .route(
            "/api/chunk/add",
            post(handlers::upload_chunk).layer(DefaultBodyLimit::max(20 * 1024 * 1024)),
        ) // 20MB for chunk uploads
        .route(
            "/api/chunk/complete",
            post(handlers::complete_upload).layer(DefaultBodyLimit::max(1024 * 1024)),
        ) // 1MB for JSON requests
        .route(
            "/api/upload/status/:session_id",
            get(handlers::upload_status_feed),
        )
        // API file operations
        .route("/api/files/list", get(handlers::list_files))
        // Web downloads
        .route(
            "/d",
            get(handlers::download_file).post(handlers::download_file_with_password),
        )
        .route("/d/:id/:filename", get(handlers::download_file_named))
        // Hotlinks
        .route("/h/:hotlink_id", get(handlers::hotlink_file))
        .route("/dh/:id/:filename", get(handlers::hotlink_file_named))
        // Health check
        .route("/health", get(handlers::health_check))
        // Add middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

#[cfg(test)]
impl AppState {
    /// In-memory database, temp-dir storage, no background sweeper.
    pub async fn for_tests(storage_dir: &std::path::Path) -> AppState {
        let db = database::setup_test_database().await;

        let local = LocalStorage::new(storage_dir);
        local.init().await.unwrap();
        let storage = Arc::new(StorageRouter::new(local));

        let assembler = Arc::new(ChunkAssembler::new(storage_dir, 1024 * 1024 * 1024));
        assembler.init().await.unwrap();

        let status = Arc::new(StatusBoard::new());
        let processor = Arc::new(UploadProcessor::new(
            db.clone(),
            assembler.clone(),
            storage.clone(),
            status.clone(),
        ));

        let sessions = Arc::new(SessionRegistry::new());
        let api_keys = Arc::new(ApiKeyRegistry::new());

        let gate = Arc::new(DownloadGate::new(
            db.clone(),
            storage.clone(),
            sessions.clone(),
            api_keys.clone(),
            chrono::Duration::seconds(60),
        ));

        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            server_address: "127.0.0.1:0".to_string(),
            storage_dir: storage_dir.to_string_lossy().to_string(),
            base_url: "http://localhost:3000".to_string(),
            max_file_size: 100 * 1024 * 1024,
            staging_capacity: 1024 * 1024 * 1024,
            session_idle_secs: 3600,
            sweep_interval_secs: 60,
            deletion_grace_secs: 60,
            api_keys: Vec::new(),
            bucket_name: None,
            bucket_region: "us-east-1".to_string(),
            bucket_endpoint: None,
        };

        AppState {
            db,
            config,
            assembler,
            storage,
            status,
            processor,
            gate,
            sessions,
            api_keys,
        }
    }
}
