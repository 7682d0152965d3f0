//! Configuration module
//!
//! Configuration for the upload pipeline: database, storage, validation
//! limits, thumbnail derivation, quota warnings and the task queue. Values are
//! read from the environment (optionally seeded from a `.env` file).

use std::env;

use crate::storage_types::StorageBackend;

const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Base configuration shared by every binary
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub environment: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    /// `compact` (default) or `json`
    pub log_format: String,
}

/// Upload pipeline configuration
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub base: BaseConfig,
    pub database_url: String,
    // Storage configuration
    pub storage_backend: StorageBackend,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub local_storage_path: Option<String>,
    pub local_storage_base_url: Option<String>,
    // Validation
    pub max_file_size_bytes: usize,
    pub max_video_size_bytes: usize,
    pub allowed_content_types: Vec<String>,
    // Variants
    pub thumbnail_max_dimension: u32,
    // Quota
    pub quota_warning_threshold: f64,
    // Task queue configuration
    pub task_queue_max_workers: usize,
    pub task_queue_poll_interval_ms: u64,
    pub task_queue_timeout_seconds: i32,
    pub task_queue_max_retries: i32,
    pub task_queue_retry_backoff_secs: u64,
    /// Interval in seconds between runs of the stale task reaper. 0 = disabled.
    pub task_queue_stale_task_reap_interval_secs: u64,
    /// Grace period in seconds added to task timeout before reaping stale running tasks.
    pub task_queue_stale_task_grace_period_secs: i64,
}

/// Application configuration
#[derive(Clone, Debug)]
pub struct Config(pub Box<PipelineConfig>);

impl Config {
    fn inner(&self) -> &PipelineConfig {
        &self.0
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = PipelineConfig::from_env()?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.inner().validate()
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.inner().base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn environment(&self) -> &str {
        &self.inner().base.environment
    }

    pub fn log_format(&self) -> &str {
        &self.inner().base.log_format
    }

    pub fn db_max_connections(&self) -> u32 {
        self.inner().base.db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.inner().base.db_timeout_seconds
    }

    pub fn database_url(&self) -> &str {
        &self.inner().database_url
    }

    pub fn storage_backend(&self) -> StorageBackend {
        self.inner().storage_backend
    }

    pub fn s3_bucket(&self) -> Option<&str> {
        self.inner().s3_bucket.as_deref()
    }

    pub fn s3_region(&self) -> Option<&str> {
        self.inner().s3_region.as_deref()
    }

    pub fn s3_endpoint(&self) -> Option<&str> {
        self.inner().s3_endpoint.as_deref()
    }

    pub fn local_storage_path(&self) -> Option<&str> {
        self.inner().local_storage_path.as_deref()
    }

    pub fn local_storage_base_url(&self) -> Option<&str> {
        self.inner().local_storage_base_url.as_deref()
    }

    pub fn max_file_size_bytes(&self) -> usize {
        self.inner().max_file_size_bytes
    }

    pub fn max_video_size_bytes(&self) -> usize {
        self.inner().max_video_size_bytes
    }

    pub fn allowed_content_types(&self) -> &[String] {
        &self.inner().allowed_content_types
    }

    pub fn thumbnail_max_dimension(&self) -> u32 {
        self.inner().thumbnail_max_dimension
    }

    pub fn quota_warning_threshold(&self) -> f64 {
        self.inner().quota_warning_threshold
    }

    pub fn task_queue_max_workers(&self) -> usize {
        self.inner().task_queue_max_workers
    }

    pub fn task_queue_poll_interval_ms(&self) -> u64 {
        self.inner().task_queue_poll_interval_ms
    }

    pub fn task_queue_timeout_seconds(&self) -> i32 {
        self.inner().task_queue_timeout_seconds
    }

    pub fn task_queue_max_retries(&self) -> i32 {
        self.inner().task_queue_max_retries
    }

    pub fn task_queue_retry_backoff_secs(&self) -> u64 {
        self.inner().task_queue_retry_backoff_secs
    }

    pub fn task_queue_stale_task_reap_interval_secs(&self) -> u64 {
        self.inner().task_queue_stale_task_reap_interval_secs
    }

    pub fn task_queue_stale_task_grace_period_secs(&self) -> i64 {
        self.inner().task_queue_stale_task_grace_period_secs
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        const MAX_FILE_SIZE_MB: usize = 25;
        const MAX_VIDEO_SIZE_MB: usize = 500;
        const THUMBNAIL_MAX_DIMENSION: u32 = 400;
        const QUOTA_WARNING_THRESHOLD: f64 = 0.8;
        const TASK_QUEUE_MAX_WORKERS: usize = 4;
        const TASK_QUEUE_POLL_INTERVAL_MS: u64 = 1000;
        const TASK_QUEUE_TIMEOUT_SECS: i32 = 120;
        // Two retries, three attempts in total.
        const TASK_QUEUE_MAX_RETRIES: i32 = 2;
        const TASK_QUEUE_RETRY_BACKOFF_SECS: u64 = 10;
        const STALE_TASK_REAP_INTERVAL_SECS: u64 = 60;
        const STALE_TASK_GRACE_PERIOD_SECS: i64 = 300;
        const DEFAULT_CONTENT_TYPES: &str =
            "image/jpeg,image/png,image/gif,image/webp,video/mp4,video/quicktime,video/webm";

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let storage_backend = match env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => StorageBackend::Local,
        };

        let config = PipelineConfig {
            base: BaseConfig {
                environment,
                db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
                db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
                log_format: env::var("LOG_FORMAT")
                    .unwrap_or_else(|_| "compact".to_string())
                    .to_lowercase(),
            },
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            storage_backend,
            s3_bucket: env::var("S3_BUCKET").ok().filter(|s| !s.is_empty()),
            s3_region: ["S3_REGION", "AWS_REGION"]
                .into_iter()
                .find_map(|name| env::var(name).ok().filter(|s| !s.is_empty())),
            s3_endpoint: env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            local_storage_path: env::var("LOCAL_STORAGE_PATH").ok().filter(|s| !s.is_empty()),
            local_storage_base_url: env::var("LOCAL_STORAGE_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            max_file_size_bytes: env_or("MAX_FILE_SIZE_MB", MAX_FILE_SIZE_MB) * 1024 * 1024,
            max_video_size_bytes: env_or("MAX_VIDEO_SIZE_MB", MAX_VIDEO_SIZE_MB) * 1024 * 1024,
            allowed_content_types: env_list("ALLOWED_CONTENT_TYPES", DEFAULT_CONTENT_TYPES),
            thumbnail_max_dimension: env_or("THUMBNAIL_MAX_DIMENSION", THUMBNAIL_MAX_DIMENSION),
            quota_warning_threshold: env_or("QUOTA_WARNING_THRESHOLD", QUOTA_WARNING_THRESHOLD),
            task_queue_max_workers: env_or("TASK_QUEUE_MAX_WORKERS", TASK_QUEUE_MAX_WORKERS),
            task_queue_poll_interval_ms: env_or(
                "TASK_QUEUE_POLL_INTERVAL_MS",
                TASK_QUEUE_POLL_INTERVAL_MS,
            ),
            task_queue_timeout_seconds: env_or(
                "TASK_QUEUE_TIMEOUT_SECONDS",
                TASK_QUEUE_TIMEOUT_SECS,
            ),
            task_queue_max_retries: env_or("TASK_QUEUE_MAX_RETRIES", TASK_QUEUE_MAX_RETRIES),
            task_queue_retry_backoff_secs: env_or(
                "TASK_QUEUE_RETRY_BACKOFF_SECS",
                TASK_QUEUE_RETRY_BACKOFF_SECS,
            ),
            task_queue_stale_task_reap_interval_secs: env_or(
                "STALE_TASK_REAP_INTERVAL_SECS",
                STALE_TASK_REAP_INTERVAL_SECS,
            ),
            task_queue_stale_task_grace_period_secs: env_or(
                "STALE_TASK_GRACE_PERIOD_SECS",
                STALE_TASK_GRACE_PERIOD_SECS,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.allowed_content_types.is_empty() {
            return Err(anyhow::anyhow!(
                "ALLOWED_CONTENT_TYPES must list at least one content type"
            ));
        }

        if self.thumbnail_max_dimension == 0 {
            return Err(anyhow::anyhow!(
                "THUMBNAIL_MAX_DIMENSION must be greater than zero"
            ));
        }

        if !(0.0..=1.0).contains(&self.quota_warning_threshold) {
            return Err(anyhow::anyhow!(
                "QUOTA_WARNING_THRESHOLD must be between 0.0 and 1.0"
            ));
        }

        if self.task_queue_max_workers == 0 {
            return Err(anyhow::anyhow!(
                "TASK_QUEUE_MAX_WORKERS must be at least 1"
            ));
        }

        if self.task_queue_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!(
                "TASK_QUEUE_TIMEOUT_SECONDS must be positive"
            ));
        }

        if self.task_queue_max_retries < 0 {
            return Err(anyhow::anyhow!(
                "TASK_QUEUE_MAX_RETRIES cannot be negative"
            ));
        }

        match self.storage_backend {
            StorageBackend::S3 => {
                if self.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
                if self.s3_region.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_REGION or AWS_REGION must be set when using S3 storage backend"
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_storage_path.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must be set when using local storage backend"
                    ));
                }
                if self.local_storage_base_url.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_BASE_URL must be set when using local storage backend"
                    ));
                }
            }
        }

        Ok(())
    }
}
