//! Quota Tracker: per-wedding media usage against the plan limits.

use std::sync::Arc;

use nuptia_core::models::{QuotaCheckResult, QuotaUsage, DEFAULT_WARNING_THRESHOLD};
use nuptia_core::AppError;
use nuptia_db::{MediaStore, PlanStore};
use uuid::Uuid;

#[derive(Clone)]
pub struct QuotaService {
    plans: Arc<dyn PlanStore>,
    media: Arc<dyn MediaStore>,
    warning_threshold: f64,
}

impl QuotaService {
    pub fn new(plans: Arc<dyn PlanStore>, media: Arc<dyn MediaStore>) -> Self {
        Self {
            plans,
            media,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }

    /// Default threshold used by [`QuotaService::is_near_limit`].
    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold;
        self
    }

    /// Current usage. Only `completed` media counts.
    #[tracing::instrument(skip(self))]
    pub async fn get_usage(&self, wedding_id: Uuid) -> Result<QuotaUsage, AppError> {
        let limit = self.plans.plan_for_wedding(wedding_id).await?;
        let totals = self.media.completed_totals(wedding_id).await?;
        Ok(QuotaUsage::new(wedding_id, totals, limit))
    }

    /// Whether `file_count` more files totalling `file_size` bytes fit in the plan.
    #[tracing::instrument(skip(self))]
    pub async fn can_upload(
        &self,
        wedding_id: Uuid,
        file_size: i64,
        file_count: i64,
    ) -> Result<QuotaCheckResult, AppError> {
        let usage = self.get_usage(wedding_id).await?;
        let result = QuotaCheckResult::evaluate(usage, file_size, file_count);

        if !result.can_upload {
            tracing::warn!(
                wedding_id = %wedding_id,
                file_size = file_size,
                file_count = file_count,
                reason = result.reason.as_deref().unwrap_or_default(),
                "Upload refused by quota"
            );
        }

        Ok(result)
    }

    /// Advisory warning: either dimension at or above `threshold` (a
    /// fraction, default 0.8) of its limit.
    pub fn is_near_limit(&self, usage: &QuotaUsage, threshold: Option<f64>) -> bool {
        usage.is_near_limit(threshold.unwrap_or(self.warning_threshold))
    }

    /// The larger of the two usage percentages.
    pub async fn usage_percentage(&self, wedding_id: Uuid) -> Result<f64, AppError> {
        Ok(self.get_usage(wedding_id).await?.max_percentage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nuptia_core::models::{MediaStatus, PlanLimit, PlanTier, SiteMedia};
    use nuptia_db::{InMemoryMediaStore, InMemoryPlanStore};
    use std::collections::BTreeMap;

    fn media(wedding_id: Uuid, size: i64, status: MediaStatus) -> SiteMedia {
        let now = Utc::now();
        SiteMedia {
            id: Uuid::new_v4(),
            wedding_id,
            album_id: None,
            batch_id: None,
            path: "weddings/w/media/x.jpg".to_string(),
            disk: "local".to_string(),
            original_name: "x.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            size,
            width: None,
            height: None,
            variants: BTreeMap::new(),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    async fn service_with(limit: PlanLimit, items: Vec<SiteMedia>) -> QuotaService {
        let plans = InMemoryPlanStore::new();
        plans.set_limit(limit);
        let store = InMemoryMediaStore::new();
        for item in &items {
            store.insert_media(item).await.unwrap();
        }
        QuotaService::new(Arc::new(plans), Arc::new(store))
    }

    fn free(max_files: i64, max_storage_bytes: i64) -> PlanLimit {
        PlanLimit {
            tier: PlanTier::Free,
            max_files,
            max_storage_bytes,
        }
    }

    #[tokio::test]
    async fn usage_counts_only_completed_media() {
        let wedding = Uuid::new_v4();
        let service = service_with(
            free(10, 1000),
            vec![
                media(wedding, 100, MediaStatus::Completed),
                media(wedding, 50, MediaStatus::Failed),
                media(Uuid::new_v4(), 70, MediaStatus::Completed),
            ],
        )
        .await;

        let usage = service.get_usage(wedding).await.unwrap();
        assert_eq!(usage.current_files, 1);
        assert_eq!(usage.current_storage_bytes, 100);
        assert_eq!(usage.files_percentage, 10.0);
        assert_eq!(usage.storage_percentage, 10.0);
    }

    #[tokio::test]
    async fn reaching_the_limit_exactly_is_allowed() {
        let wedding = Uuid::new_v4();
        let service = service_with(
            free(10, 1000),
            vec![media(wedding, 900, MediaStatus::Completed)],
        )
        .await;

        assert!(service.can_upload(wedding, 100, 1).await.unwrap().can_upload);
        let refused = service.can_upload(wedding, 101, 1).await.unwrap();
        assert!(!refused.can_upload);
        assert!(refused.reason.unwrap().contains("Storage limit"));
    }

    #[tokio::test]
    async fn full_free_plan_gets_upgrade_message() {
        let wedding = Uuid::new_v4();
        let items = (0..10)
            .map(|_| media(wedding, 1, MediaStatus::Completed))
            .collect();
        let service = service_with(free(10, 1_000_000), items).await;

        let result = service.can_upload(wedding, 1, 1).await.unwrap();
        assert!(!result.can_upload);
        assert!(result.upgrade_message.is_some());
        assert_eq!(service.usage_percentage(wedding).await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn zero_limit_reads_as_full() {
        let wedding = Uuid::new_v4();
        let service = service_with(free(0, 0), vec![]).await;

        let usage = service.get_usage(wedding).await.unwrap();
        assert_eq!(usage.files_percentage, 100.0);
        assert!(!service.can_upload(wedding, 1, 1).await.unwrap().can_upload);
    }

    #[tokio::test]
    async fn near_limit_uses_threshold() {
        let wedding = Uuid::new_v4();
        let items = (0..8)
            .map(|_| media(wedding, 1, MediaStatus::Completed))
            .collect();
        let service = service_with(free(10, 1_000_000), items).await;

        let usage = service.get_usage(wedding).await.unwrap();
        assert!(service.is_near_limit(&usage, None));
        assert!(!service.is_near_limit(&usage, Some(0.9)));
    }
}
