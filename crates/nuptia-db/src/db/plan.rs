//! Plan limit lookup.

use async_trait::async_trait;
use nuptia_core::models::{PlanLimit, PlanTier};
use nuptia_core::AppError;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::traits::PlanStore;

#[derive(Clone)]
pub struct PlanRepository {
    pool: PgPool,
}

impl PlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Put a wedding on a tier.
    #[tracing::instrument(skip(self), fields(db.table = "wedding_plans"))]
    pub async fn set_tier(&self, wedding_id: Uuid, tier: PlanTier) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO wedding_plans (wedding_id, tier)
            VALUES ($1, $2)
            ON CONFLICT (wedding_id) DO UPDATE SET tier = EXCLUDED.tier, updated_at = NOW()
            "#,
        )
        .bind(wedding_id)
        .bind(tier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PlanStore for PlanRepository {
    #[tracing::instrument(skip(self), fields(db.table = "wedding_plans"))]
    async fn plan_for_wedding(&self, wedding_id: Uuid) -> Result<PlanLimit, AppError> {
        let tier: Option<PlanTier> = sqlx::query_scalar::<Postgres, PlanTier>(
            "SELECT tier FROM wedding_plans WHERE wedding_id = $1",
        )
        .bind(wedding_id)
        .fetch_optional(&self.pool)
        .await?;
        let tier = tier.unwrap_or_default();

        let limit: Option<PlanLimit> = sqlx::query_as::<Postgres, PlanLimit>(
            "SELECT tier, max_files, max_storage_bytes FROM plan_limits WHERE tier = $1",
        )
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(limit.unwrap_or_else(|| PlanLimit::default_for(tier)))
    }
}
