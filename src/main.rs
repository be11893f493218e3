use gitlab_mirror::config::AppConfig;
use gitlab_mirror::db;
use gitlab_mirror::error::AppError;
use gitlab_mirror::services::sync_engine::SyncEngine;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    log::info!(
        "Starting gitlab-mirror (db: {}, interval: {}s)",
        config.database_path.display(),
        config.sync.interval_secs
    );

    let pool = db::initialize(&config.database_path).await?;
    let handle = SyncEngine::start_background(pool, config.oauth, config.sync)?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AppError::internal(format!("Failed to listen for shutdown signal: {}", e)))?;
    log::info!("Shutdown signal received");

    handle.stop().await?;
    Ok(())
}
