use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

const GIB: i64 = 1024 * 1024 * 1024;

/// Subscription tier of a wedding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "plan_tier", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Essential,
    Premium,
}

impl PlanTier {
    /// The entry-level plan gets upgrade prompts when a quota is exhausted.
    pub fn is_entry_level(&self) -> bool {
        matches!(self, PlanTier::Free)
    }
}

impl Display for PlanTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            PlanTier::Free => write!(f, "free"),
            PlanTier::Essential => write!(f, "essential"),
            PlanTier::Premium => write!(f, "premium"),
        }
    }
}

/// Media ceilings for a subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PlanLimit {
    pub tier: PlanTier,
    pub max_files: i64,
    pub max_storage_bytes: i64,
}

impl PlanLimit {
    /// Built-in limits used when no override is stored for a tier.
    pub fn default_for(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Free => Self {
                tier,
                max_files: 100,
                max_storage_bytes: GIB,
            },
            PlanTier::Essential => Self {
                tier,
                max_files: 2_000,
                max_storage_bytes: 20 * GIB,
            },
            PlanTier::Premium => Self {
                tier,
                max_files: 20_000,
                max_storage_bytes: 200 * GIB,
            },
        }
    }
}
