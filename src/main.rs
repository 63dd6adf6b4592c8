use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oa_upload_server::config::Config;
use oa_upload_server::db::{self, SqliteChunkIndex, SqliteSessionStore};
use oa_upload_server::routes;
use oa_upload_server::state::AppState;
use oa_upload_server::upload::{ChunkStore, LocalChunkStorage, UploadService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "oa_upload_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting OA Upload Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Chunk directory: {}", config.upload.chunk_dir.display());
    tracing::info!("Artifact directory: {}", config.upload.artifact_dir.display());

    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let chunks = ChunkStore::new(
        Arc::new(SqliteChunkIndex::new(db_pool.clone())),
        Arc::new(LocalChunkStorage::new(config.upload.chunk_dir.clone())),
    );
    let uploads = UploadService::new(
        config.upload.clone(),
        Arc::new(SqliteSessionStore::new(db_pool.clone())),
        chunks,
    );

    let sweeper = uploads.sweeper().clone().start(config.upload.sweep_interval());
    tracing::info!(
        "Expired session sweep every {}s",
        config.upload.sweep_interval_secs
    );

    let app = routes::build_router(AppState::new(config.clone(), uploads));

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST: {}", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("OA Upload Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    db_pool.close().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
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
