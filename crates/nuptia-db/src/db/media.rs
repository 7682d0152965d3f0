//! Site media repository.

use async_trait::async_trait;
use nuptia_core::models::{MediaTotals, SiteMedia};
use nuptia_core::AppError;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::traits::MediaStore;

const MEDIA_COLUMNS: &str = "id, wedding_id, album_id, batch_id, path, disk, original_name, \
    mime_type, size, width, height, variants, status, created_at, updated_at";

#[derive(Clone)]
pub struct MediaRepository {
    pool: PgPool,
}

impl MediaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MediaStore for MediaRepository {
    #[tracing::instrument(skip(self, media), fields(db.table = "site_media", db.record_id = %media.id))]
    async fn insert_media(&self, media: &SiteMedia) -> Result<SiteMedia, AppError> {
        let variants = serde_json::to_value(&media.variants)?;
        let sql = format!(
            r#"
            INSERT INTO site_media (
                id, wedding_id, album_id, batch_id, path, disk, original_name, mime_type,
                size, width, height, variants, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            RETURNING {}
            "#,
            MEDIA_COLUMNS
        );
        let inserted = sqlx::query_as::<Postgres, SiteMedia>(&sql)
            .bind(media.id)
            .bind(media.wedding_id)
            .bind(media.album_id)
            .bind(media.batch_id)
            .bind(&media.path)
            .bind(&media.disk)
            .bind(&media.original_name)
            .bind(&media.mime_type)
            .bind(media.size)
            .bind(media.width)
            .bind(media.height)
            .bind(variants)
            .bind(media.status)
            .bind(media.created_at)
            .bind(media.updated_at)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(row),
            None => {
                tracing::debug!(media_id = %media.id, "Media row already exists");
                self.get_media(media.wedding_id, media.id)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(format!(
                            "Media {} exists under another wedding",
                            media.id
                        ))
                    })
            }
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "site_media", db.record_id = %id))]
    async fn get_media(&self, wedding_id: Uuid, id: Uuid) -> Result<Option<SiteMedia>, AppError> {
        let sql = format!(
            "SELECT {} FROM site_media WHERE wedding_id = $1 AND id = $2",
            MEDIA_COLUMNS
        );
        let media = sqlx::query_as::<Postgres, SiteMedia>(&sql)
            .bind(wedding_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(media)
    }

    #[tracing::instrument(skip(self), fields(db.table = "site_media"))]
    async fn list_batch_media(&self, batch_id: Uuid) -> Result<Vec<SiteMedia>, AppError> {
        let sql = format!(
            "SELECT {} FROM site_media WHERE batch_id = $1 ORDER BY created_at ASC",
            MEDIA_COLUMNS
        );
        let media = sqlx::query_as::<Postgres, SiteMedia>(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(media)
    }

    #[tracing::instrument(skip(self), fields(db.table = "site_media"))]
    async fn completed_totals(&self, wedding_id: Uuid) -> Result<MediaTotals, AppError> {
        let (file_count, total_bytes): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::bigint, COALESCE(SUM(size), 0)::bigint
            FROM site_media
            WHERE wedding_id = $1 AND status = 'completed'
            "#,
        )
        .bind(wedding_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(MediaTotals {
            file_count,
            total_bytes,
        })
    }
}
