//! Shared key generation for storage backends.
//!
//! Staged uploads live under `staging/{batch_id}/`, stored media under
//! `weddings/{wedding_id}/media/`.

use crate::traits::{StorageError, StorageResult};
use uuid::Uuid;

const FALLBACK_EXTENSION: &str = "bin";

/// Lowercased extension of `filename`, limited to ASCII alphanumerics.
/// Falls back to `bin` when the name has no usable extension.
pub fn extension_of(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 10)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

pub fn staging_key(batch_id: Uuid, file_id: Uuid, ext: &str) -> String {
    format!("staging/{}/{}.{}", batch_id, file_id, ext)
}

pub fn media_key(wedding_id: Uuid, file_id: Uuid, ext: &str) -> String {
    format!("weddings/{}/media/{}.{}", wedding_id, file_id, ext)
}

pub fn thumbnail_key(wedding_id: Uuid, file_id: Uuid, ext: &str) -> String {
    format!("weddings/{}/media/{}_thumb.{}", wedding_id, file_id, ext)
}

/// Reject keys that could escape the storage root.
pub fn validate_key(storage_key: &str) -> StorageResult<()> {
    if storage_key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if storage_key.contains("..") || storage_key.starts_with('/') || storage_key.contains('\\') {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of("Cake.JPG"), "jpg");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
    }

    #[test]
    fn missing_or_odd_extension_falls_back() {
        assert_eq!(extension_of("README"), "bin");
        assert_eq!(extension_of("photo."), "bin");
        assert_eq!(extension_of("photo.j/pg"), "bin");
    }

    #[test]
    fn media_and_thumbnail_share_a_directory() {
        let wedding = Uuid::new_v4();
        let file = Uuid::new_v4();
        let media = media_key(wedding, file, "png");
        let thumb = thumbnail_key(wedding, file, "png");
        assert_eq!(
            media.rsplit_once('/').map(|(dir, _)| dir),
            thumb.rsplit_once('/').map(|(dir, _)| dir)
        );
        assert!(thumb.ends_with("_thumb.png"));
    }

    #[test]
    fn traversal_keys_are_rejected() {
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key("staging/a/b.jpg").is_ok());
    }
}
