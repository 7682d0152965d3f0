use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::media::MediaTotals;
use super::plan::{PlanLimit, PlanTier};

pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

/// Percentage of `limit` consumed by `used`.
///
/// Not clamped: an over-quota tenant reports more than 100. A zero (or
/// negative) limit counts as already at the limit.
pub fn usage_percentage(used: i64, limit: i64) -> f64 {
    if limit <= 0 {
        return 100.0;
    }
    used as f64 / limit as f64 * 100.0
}

/// Snapshot of a wedding's media usage against its plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub wedding_id: Uuid,
    pub tier: PlanTier,
    pub current_files: i64,
    pub max_files: i64,
    pub current_storage_bytes: i64,
    pub max_storage_bytes: i64,
    pub files_percentage: f64,
    pub storage_percentage: f64,
}

impl QuotaUsage {
    pub fn new(wedding_id: Uuid, totals: MediaTotals, limit: PlanLimit) -> Self {
        Self {
            wedding_id,
            tier: limit.tier,
            current_files: totals.file_count,
            max_files: limit.max_files,
            current_storage_bytes: totals.total_bytes,
            max_storage_bytes: limit.max_storage_bytes,
            files_percentage: usage_percentage(totals.file_count, limit.max_files),
            storage_percentage: usage_percentage(totals.total_bytes, limit.max_storage_bytes),
        }
    }

    /// The larger of the two percentages
    pub fn max_percentage(&self) -> f64 {
        self.files_percentage.max(self.storage_percentage)
    }

    /// True when either dimension has reached `threshold * 100` percent.
    pub fn is_near_limit(&self, threshold: f64) -> bool {
        let bound = threshold * 100.0;
        self.files_percentage >= bound || self.storage_percentage >= bound
    }

    pub fn is_at_limit(&self) -> bool {
        self.files_percentage >= 100.0 || self.storage_percentage >= 100.0
    }

    pub fn remaining_files(&self) -> i64 {
        (self.max_files - self.current_files).max(0)
    }

    pub fn remaining_storage_bytes(&self) -> i64 {
        (self.max_storage_bytes - self.current_storage_bytes).max(0)
    }
}

/// Answer to "may this tenant add these files?".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCheckResult {
    pub can_upload: bool,
    pub reason: Option<String>,
    pub upgrade_message: Option<String>,
    pub usage: QuotaUsage,
}

impl QuotaCheckResult {
    /// Evaluate adding `file_count` files totalling `file_size` bytes on top of
    /// `usage`. Reaching a limit exactly is allowed; exceeding it is not.
    pub fn evaluate(usage: QuotaUsage, file_size: i64, file_count: i64) -> Self {
        let mut reasons = Vec::new();

        if usage.current_files.saturating_add(file_count) > usage.max_files {
            reasons.push(format!(
                "File limit reached: {} of {} files used, {} more requested",
                usage.current_files, usage.max_files, file_count
            ));
        }
        if usage.current_storage_bytes.saturating_add(file_size) > usage.max_storage_bytes {
            reasons.push(format!(
                "Storage limit reached: {} of {} bytes used, {} more requested",
                usage.current_storage_bytes, usage.max_storage_bytes, file_size
            ));
        }

        let can_upload = reasons.is_empty();
        let upgrade_message = if !can_upload && usage.tier.is_entry_level() && usage.is_at_limit() {
            Some(format!(
                "Your {} plan is full. Upgrade to keep adding photos and videos to your wedding site.",
                usage.tier
            ))
        } else {
            None
        };

        Self {
            can_upload,
            reason: (!can_upload).then(|| reasons.join("; ")),
            upgrade_message,
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(tier: PlanTier, files: i64, max_files: i64, bytes: i64, max_bytes: i64) -> QuotaUsage {
        QuotaUsage::new(
            Uuid::new_v4(),
            MediaTotals {
                file_count: files,
                total_bytes: bytes,
            },
            PlanLimit {
                tier,
                max_files,
                max_storage_bytes: max_bytes,
            },
        )
    }

    #[test]
    fn zero_limit_is_already_at_limit() {
        assert_eq!(usage_percentage(0, 0), 100.0);
        assert_eq!(usage_percentage(5, 0), 100.0);
    }

    #[test]
    fn percentage_is_not_clamped() {
        assert_eq!(usage_percentage(150, 100), 150.0);
    }

    #[test]
    fn storage_boundary_is_inclusive() {
        let u = usage(PlanTier::Essential, 0, 100, 900, 1000);
        assert!(QuotaCheckResult::evaluate(u.clone(), 100, 1).can_upload);
        let refused = QuotaCheckResult::evaluate(u, 101, 1);
        assert!(!refused.can_upload);
        assert!(refused.reason.unwrap().contains("Storage limit"));
    }

    #[test]
    fn full_entry_plan_gets_upgrade_message() {
        let u = usage(PlanTier::Free, 10, 10, 0, 1000);
        let result = QuotaCheckResult::evaluate(u, 1, 1);
        assert!(!result.can_upload);
        assert!(result.reason.is_some());
        assert!(result.upgrade_message.is_some());
    }

    #[test]
    fn paid_plan_gets_no_upgrade_message() {
        let u = usage(PlanTier::Premium, 10, 10, 0, 1000);
        let result = QuotaCheckResult::evaluate(u, 1, 1);
        assert!(!result.can_upload);
        assert!(result.upgrade_message.is_none());
    }

    #[test]
    fn near_limit_uses_either_dimension() {
        let u = usage(PlanTier::Free, 8, 10, 0, 1000);
        assert!(u.is_near_limit(0.8));
        assert!(!u.is_near_limit(0.9));
        let u = usage(PlanTier::Free, 0, 10, 850, 1000);
        assert!(u.is_near_limit(DEFAULT_WARNING_THRESHOLD));
    }
}
