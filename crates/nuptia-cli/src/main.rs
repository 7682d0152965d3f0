//! Nuptia operator CLI: runs the upload worker and manages upload batches.
//!
//! Configuration comes from the environment (or `.env`), see `Config`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use nuptia_cli::setup::{build_pipeline, connect_database, postgres_stores, run_migrations};
use nuptia_cli::{guess_content_type, init_tracing, print_json};
use nuptia_core::Config;
use nuptia_services::IncomingFile;
use nuptia_worker::{TaskHandlerContext, TaskQueue, TaskQueueConfig};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "nuptia", about = "Wedding media upload pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the upload worker until interrupted
    Worker,
    /// Apply database migrations
    Migrate,
    /// Upload batch operations
    Batch {
        #[command(subcommand)]
        sub: BatchCommands,
    },
    /// Stage local files as a new batch and enqueue them for processing
    Upload {
        /// Wedding UUID
        #[arg(long)]
        wedding: Uuid,
        /// Target album UUID
        #[arg(long)]
        album: Option<Uuid>,
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show media usage against the wedding's plan
    Quota {
        /// Wedding UUID
        #[arg(long)]
        wedding: Uuid,
    },
}

#[derive(Subcommand)]
enum BatchCommands {
    /// Register a batch expecting `total` files
    Create {
        #[arg(long)]
        wedding: Uuid,
        #[arg(long)]
        total: i32,
        #[arg(long)]
        album: Option<Uuid>,
    },
    /// Show progress and per-file errors
    Status {
        #[arg(long)]
        wedding: Uuid,
        batch: Uuid,
    },
    /// Cancel a pending or processing batch
    Cancel {
        #[arg(long)]
        wedding: Uuid,
        batch: Uuid,
    },
    /// List batches, newest first
    List {
        #[arg(long)]
        wedding: Uuid,
        /// Include finished and cancelled batches
        #[arg(long)]
        include_completed: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    init_tracing(config.log_format());

    let pool = connect_database(&config).await?;

    match cli.command {
        Commands::Migrate => run_migrations(&pool).await?,
        Commands::Worker => run_worker(&config, pool).await?,
        Commands::Batch { sub } => {
            let pipeline = build_pipeline(&config, &pool).await?;
            match sub {
                BatchCommands::Create {
                    wedding,
                    total,
                    album,
                } => {
                    let batch = pipeline.batches.create_batch(wedding, total, album).await?;
                    print_json(&batch)?;
                }
                BatchCommands::Status { wedding, batch } => {
                    let status = pipeline.status.get_batch_status(wedding, batch).await?;
                    print_json(&serde_json::json!({
                        "status": status,
                        "progress_percentage": status.progress_percentage(),
                        "is_complete": status.is_complete(),
                    }))?;
                }
                BatchCommands::Cancel { wedding, batch } => {
                    let cancelled = pipeline.batches.cancel_batch(wedding, batch).await?;
                    print_json(&serde_json::json!({ "batch_id": batch, "cancelled": cancelled }))?;
                }
                BatchCommands::List {
                    wedding,
                    include_completed,
                } => {
                    let batches = pipeline.batches.get_batches(wedding, include_completed).await?;
                    print_json(&batches)?;
                }
            }
        }
        Commands::Upload {
            wedding,
            album,
            files,
        } => {
            let pipeline = build_pipeline(&config, &pool).await?;

            let mut incoming = Vec::with_capacity(files.len());
            for path in &files {
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let original_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_string());
                incoming.push(IncomingFile {
                    mime_type: guess_content_type(path, &data),
                    original_name,
                    data,
                });
            }

            let check = pipeline
                .quota
                .can_upload(
                    wedding,
                    incoming.iter().map(|f| f.data.len() as i64).sum(),
                    incoming.len() as i64,
                )
                .await?;
            if !check.can_upload {
                print_json(&check)?;
                anyhow::bail!("Upload refused by quota");
            }

            let batch = pipeline.submit(wedding, album, incoming).await?;
            print_json(&batch)?;
        }
        Commands::Quota { wedding } => {
            let pipeline = build_pipeline(&config, &pool).await?;
            let usage = pipeline.quota.get_usage(wedding).await?;
            print_json(&serde_json::json!({
                "near_limit": pipeline.quota.is_near_limit(&usage, None),
                "usage_percentage": usage.max_percentage(),
                "usage": usage,
            }))?;
        }
    }

    Ok(())
}

async fn run_worker(config: &Config, pool: sqlx::PgPool) -> anyhow::Result<()> {
    run_migrations(&pool).await?;
    let pipeline = build_pipeline(config, &pool).await?;

    let context: Arc<dyn TaskHandlerContext> = pipeline.task_context();
    let queue_config = TaskQueueConfig::from_config(config);
    tracing::info!(
        max_workers = queue_config.max_workers,
        max_retries = queue_config.max_retries,
        "Starting upload worker"
    );
    let queue = TaskQueue::new(
        postgres_stores(&pool).tasks,
        queue_config,
        Arc::downgrade(&context),
        Some(pool),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    queue.shutdown().await;
    tracing::info!("Upload worker stopped");
    Ok(())
}
