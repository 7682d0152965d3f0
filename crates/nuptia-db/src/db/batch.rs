//! Upload batch repository: batches and their per-file outcome ledger.

use async_trait::async_trait;
use nuptia_core::models::{
    BatchFileOutcome, BatchListQuery, BatchState, FileOutcome, OutcomeRecord, UploadBatch,
};
use nuptia_core::AppError;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::traits::BatchStore;

const BATCH_COLUMNS: &str = "id, wedding_id, album_id, total_files, completed_files, \
    failed_files, status, created_at, updated_at";

#[derive(Clone)]
pub struct BatchRepository {
    pool: PgPool,
}

impl BatchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchStore for BatchRepository {
    #[tracing::instrument(skip(self, batch), fields(db.table = "upload_batches", batch_id = %batch.id))]
    async fn create_batch(&self, batch: &UploadBatch) -> Result<UploadBatch, AppError> {
        let sql = format!(
            r#"
            INSERT INTO upload_batches (
                id, wedding_id, album_id, total_files, completed_files, failed_files,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 0, 0, 'pending', $5, $5)
            RETURNING {}
            "#,
            BATCH_COLUMNS
        );
        let created = sqlx::query_as::<Postgres, UploadBatch>(&sql)
            .bind(batch.id)
            .bind(batch.wedding_id)
            .bind(batch.album_id)
            .bind(batch.total_files)
            .bind(batch.created_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(created)
    }

    #[tracing::instrument(skip(self), fields(db.table = "upload_batches"))]
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<UploadBatch>, AppError> {
        let sql = format!("SELECT {} FROM upload_batches WHERE id = $1", BATCH_COLUMNS);
        let batch = sqlx::query_as::<Postgres, UploadBatch>(&sql)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(batch)
    }

    #[tracing::instrument(skip(self), fields(db.table = "upload_batches"))]
    async fn get_batch_for_wedding(
        &self,
        wedding_id: Uuid,
        batch_id: Uuid,
    ) -> Result<Option<UploadBatch>, AppError> {
        let sql = format!(
            "SELECT {} FROM upload_batches WHERE wedding_id = $1 AND id = $2",
            BATCH_COLUMNS
        );
        let batch = sqlx::query_as::<Postgres, UploadBatch>(&sql)
            .bind(wedding_id)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(batch)
    }

    #[tracing::instrument(skip(self), fields(db.table = "upload_batches"))]
    async fn list_batches(
        &self,
        wedding_id: Uuid,
        query: &BatchListQuery,
    ) -> Result<Vec<UploadBatch>, AppError> {
        let limit = query.limit.unwrap_or(50).clamp(1, 1000);
        let offset = query.offset.unwrap_or(0).max(0);

        let mut sql = format!(
            "SELECT {} FROM upload_batches WHERE wedding_id = $1",
            BATCH_COLUMNS
        );
        if !query.include_completed {
            sql.push_str(" AND status IN ('pending', 'processing')");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3");

        let batches = sqlx::query_as::<Postgres, UploadBatch>(&sql)
            .bind(wedding_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(batches)
    }

    #[tracing::instrument(skip(self), fields(db.table = "upload_batches"))]
    async fn cancel_batch(&self, wedding_id: Uuid, batch_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_batches
            SET status = 'cancelled', updated_at = NOW()
            WHERE wedding_id = $1 AND id = $2 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(wedding_id)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), fields(db.table = "upload_batches"))]
    async fn mark_processing(&self, batch_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE upload_batches
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The outcome row and the counter update commit together. The counter
    /// update is a single conditional `UPDATE ... RETURNING`, so concurrent
    /// workers serialize on the batch row and the status `CASE` sees the
    /// post-increment values.
    #[tracing::instrument(skip(self, error), fields(db.table = "upload_batches"))]
    async fn record_outcome(
        &self,
        batch_id: Uuid,
        file_id: Uuid,
        original_name: &str,
        outcome: FileOutcome,
        error: Option<&str>,
    ) -> Result<OutcomeRecord, AppError> {
        let (completed_inc, failed_inc): (i32, i32) = match outcome {
            FileOutcome::Completed => (1, 0),
            FileOutcome::Failed => (0, 1),
        };

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO batch_file_outcomes (batch_id, file_id, original_name, outcome, error)
            SELECT $1, $2, $3, $4, $5
            WHERE EXISTS (SELECT 1 FROM upload_batches WHERE id = $1)
            ON CONFLICT (batch_id, file_id) DO NOTHING
            "#,
        )
        .bind(batch_id)
        .bind(file_id)
        .bind(original_name)
        .bind(outcome)
        .bind(error)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            if self.has_outcome(batch_id, file_id).await? {
                return Ok(OutcomeRecord::AlreadyCounted);
            }
            return Ok(OutcomeRecord::BatchMissing);
        }

        let sql = format!(
            r#"
            UPDATE upload_batches
            SET completed_files = completed_files + $2,
                failed_files = failed_files + $3,
                status = CASE
                    WHEN completed_files + failed_files + 1 < total_files
                        THEN 'processing'::batch_state
                    WHEN failed_files + $3 = 0 THEN 'completed'::batch_state
                    WHEN completed_files + $2 = 0 THEN 'failed'::batch_state
                    ELSE 'completed_with_errors'::batch_state
                END,
                updated_at = NOW()
            WHERE id = $1
                AND status IN ('pending', 'processing')
                AND completed_files + failed_files < total_files
            RETURNING {}
            "#,
            BATCH_COLUMNS
        );
        let updated = sqlx::query_as::<Postgres, UploadBatch>(&sql)
            .bind(batch_id)
            .bind(completed_inc)
            .bind(failed_inc)
            .fetch_optional(&mut *tx)
            .await?;

        match updated {
            Some(batch) => {
                tx.commit().await?;
                tracing::debug!(
                    batch_id = %batch_id,
                    file_id = %file_id,
                    completed = batch.completed_files,
                    failed = batch.failed_files,
                    status = %batch.status,
                    "Batch outcome recorded"
                );
                Ok(OutcomeRecord::Counted(batch))
            }
            None => {
                // Cancelled (or already full) between lookup and accounting.
                tx.rollback().await?;
                let state = self
                    .get_batch(batch_id)
                    .await?
                    .map(|b| b.status)
                    .unwrap_or(BatchState::Cancelled);
                Ok(OutcomeRecord::Suppressed(state))
            }
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "batch_file_outcomes"))]
    async fn has_outcome(&self, batch_id: Uuid, file_id: Uuid) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar::<Postgres, bool>(
            "SELECT EXISTS (SELECT 1 FROM batch_file_outcomes WHERE batch_id = $1 AND file_id = $2)",
        )
        .bind(batch_id)
        .bind(file_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    #[tracing::instrument(skip(self), fields(db.table = "batch_file_outcomes"))]
    async fn failed_outcomes(&self, batch_id: Uuid) -> Result<Vec<BatchFileOutcome>, AppError> {
        let rows = sqlx::query_as::<Postgres, BatchFileOutcome>(
            r#"
            SELECT batch_id, file_id, original_name, outcome, error, recorded_at
            FROM batch_file_outcomes
            WHERE batch_id = $1 AND outcome = 'failed'
            ORDER BY recorded_at ASC, file_id ASC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
