//! Attachment Server
//!
//! Accepts contract attachments as resumable chunked uploads and serves the
//! committed files.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attachment_server::audit::SqliteAuditSink;
use attachment_server::config::Config;
use attachment_server::db;
use attachment_server::routes;
use attachment_server::state::AppState;
use attachment_server::upload::{
    ArtifactStore, SessionReaper, SqliteSessionStore, StagingArea, TokenLocks, UploadCoordinator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "attachment_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Invalid configuration")?;

    tracing::info!("Starting Attachment Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Artifact directory: {}", config.upload.artifact_dir.display());
    tracing::info!("Staging directory: {}", config.upload.staging_dir.display());

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    // Storage roots
    let staging = StagingArea::open(&config.upload.staging_dir)
        .await
        .context("Failed to open staging area")?;
    let artifacts = ArtifactStore::open(&config.upload.artifact_dir)
        .await
        .context("Failed to open artifact store")?;

    let store = Arc::new(SqliteSessionStore::new(db_pool.clone()));
    let locks = TokenLocks::new();

    let coordinator = UploadCoordinator::with_max_file_size(
        store.clone(),
        staging.clone(),
        artifacts,
        locks.clone(),
        Arc::new(SqliteAuditSink::new(db_pool)),
        config.upload.max_file_size,
    );

    // Background cleanup of abandoned and failed sessions
    let reaper = SessionReaper::new(store, staging, locks, config.reaper.clone()).spawn();

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::app(AppState::new(config.clone(), coordinator))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Attachment Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
