use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ProcessUpload,
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskType::ProcessUpload => write!(f, "process_upload"),
        }
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process_upload" => Ok(TaskType::ProcessUpload),
            _ => Err(anyhow::anyhow!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "task_status", rename_all = "lowercase")
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Scheduled,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Scheduled => write!(f, "scheduled"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 3,
    #[default]
    Normal = 5,
    High = 7,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

/// A queued unit of background work, scoped to one wedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub wedding_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_seconds: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Task {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Task {
            id: row.try_get("id")?,
            wedding_id: row.try_get("wedding_id")?,
            task_type: row
                .try_get::<String, _>("task_type")?
                .parse()
                .map_err(|e| {
                    sqlx::Error::Decode(format!("Failed to parse task_type: {}", e).into())
                })?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Task {
    pub fn is_ready_to_run(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Scheduled)
            && self.scheduled_at <= Utc::now()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// One-based attempt number of the current run.
    pub fn attempt(&self) -> i32 {
        self.retry_count + 1
    }

    /// Extract the payload as a typed struct, returning an error on failure.
    pub fn try_payload_as<P: TaskPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn payload_from<P: TaskPayload>(payload: &P) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(payload)
    }
}

/// Trait for type-safe task payloads
pub trait TaskPayload: Serialize + for<'de> Deserialize<'de> {
    fn task_type() -> TaskType;
}

/// One staged file of a batch, waiting to be validated and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessUploadPayload {
    pub batch_id: Uuid,
    pub wedding_id: Uuid,
    pub file_id: Uuid,
    /// Storage key of the staged temp file
    pub staged_path: String,
    pub original_name: String,
    pub mime_type: String,
}

impl TaskPayload for ProcessUploadPayload {
    fn task_type() -> TaskType {
        TaskType::ProcessUpload
    }
}

/// A staged file the client is about to enqueue for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub file_id: Uuid,
    pub staged_path: String,
    pub original_name: String,
    pub mime_type: String,
}
