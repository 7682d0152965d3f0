//! Database and pipeline wiring

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nuptia_core::Config;
use nuptia_db::{BatchRepository, MediaRepository, PlanRepository, TaskRepository, MIGRATOR};
use nuptia_services::{create_storage, PipelineSettings, PipelineStores, UploadPipeline};
use nuptia_worker::TaskQueueConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to PostgreSQL using the pool settings from `config`.
pub async fn connect_database(config: &Config) -> Result<PgPool> {
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections())
        .acquire_timeout(Duration::from_secs(config.db_timeout_seconds()))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(config.database_url())
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.db_max_connections(),
        "Database connected successfully"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    tracing::info!("Running database migrations...");
    MIGRATOR
        .run(pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations completed");
    Ok(())
}

pub fn postgres_stores(pool: &PgPool) -> PipelineStores {
    PipelineStores {
        batches: Arc::new(BatchRepository::new(pool.clone())),
        media: Arc::new(MediaRepository::new(pool.clone())),
        plans: Arc::new(PlanRepository::new(pool.clone())),
        tasks: Arc::new(TaskRepository::new(pool.clone())),
    }
}

/// Build the upload pipeline on PostgreSQL and the configured storage backend.
pub async fn build_pipeline(config: &Config, pool: &PgPool) -> Result<UploadPipeline> {
    let storage = create_storage(config)
        .await
        .context("Failed to initialize storage backend")?;
    tracing::info!(backend = %storage.backend_type(), "Storage backend ready");

    Ok(UploadPipeline::new(
        postgres_stores(pool),
        storage,
        PipelineSettings::from_config(config),
        TaskQueueConfig::from_config(config),
    ))
}
