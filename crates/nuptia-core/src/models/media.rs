use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Name of the thumbnail entry in [`SiteMedia::variants`].
pub const THUMBNAIL_VARIANT: &str = "thumbnail";

/// Processing status of a media row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "media_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Broad media family, derived from the mime type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let mime = mime_type.to_ascii_lowercase();
        if mime.starts_with("image/") {
            MediaKind::Image
        } else if mime.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Other
        }
    }
}

/// A stored media file belonging to one wedding's site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteMedia {
    pub id: Uuid,
    pub wedding_id: Uuid,
    pub album_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub path: String,
    pub disk: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    /// Variant name → storage path (e.g. `thumbnail`)
    pub variants: BTreeMap<String, String>,
    pub status: MediaStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SiteMedia {
    pub fn kind(&self) -> MediaKind {
        MediaKind::from_mime(&self.mime_type)
    }

    pub fn thumbnail_path(&self) -> Option<&str> {
        self.variants.get(THUMBNAIL_VARIANT).map(String::as_str)
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for SiteMedia {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let variants: serde_json::Value = row.try_get("variants")?;
        let variants = serde_json::from_value(variants).map_err(|e| {
            sqlx::Error::Decode(format!("Failed to parse media variants: {}", e).into())
        })?;
        Ok(SiteMedia {
            id: row.try_get("id")?,
            wedding_id: row.try_get("wedding_id")?,
            album_id: row.try_get("album_id")?,
            batch_id: row.try_get("batch_id")?,
            path: row.try_get("path")?,
            disk: row.try_get("disk")?,
            original_name: row.try_get("original_name")?,
            mime_type: row.try_get("mime_type")?,
            size: row.try_get("size")?,
            width: row.try_get("width")?,
            height: row.try_get("height")?,
            variants,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Aggregate of a wedding's completed media, the input of quota computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTotals {
    pub file_count: i64,
    pub total_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_from_mime() {
        assert_eq!(MediaKind::from_mime("image/jpeg"), MediaKind::Image);
        assert_eq!(MediaKind::from_mime("IMAGE/PNG"), MediaKind::Image);
        assert_eq!(MediaKind::from_mime("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_mime("application/pdf"), MediaKind::Other);
    }
}
