use nuptia_core::models::MediaKind;
use nuptia_core::{AppError, Config};
use std::path::Path;

/// Extensions that must never appear anywhere in an uploaded file name.
const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "dll", "com", "bat", "cmd", "msi", "scr", "pif", "vbs", "js", "jar", "sh", "ps1",
    "php", "phtml", "asp", "aspx", "jsp", "cgi", "pl", "py", "html", "htm", "svg",
];

/// Leading bytes of native executables and scripts.
const EXECUTABLE_SIGNATURES: &[(&[u8], &str)] = &[
    (b"MZ", "Windows executable"),
    (b"\x7fELF", "ELF executable"),
    (b"#!", "script"),
    (b"\xca\xfe\xba\xbe", "Mach-O executable"),
    (b"\xcf\xfa\xed\xfe", "Mach-O executable"),
];

/// Markup that has no business inside a photo or video.
const EMBEDDED_MARKERS: &[&str] = &["<script", "<?php", "<%@", "<iframe"];

/// Common validation errors for media files
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Invalid file extension: {extension} (allowed: {allowed:?})")]
    InvalidExtension {
        extension: String,
        allowed: Vec<String>,
    },

    #[error("Invalid content type: {content_type} (allowed: {allowed:?})")]
    InvalidContentType {
        content_type: String,
        allowed: Vec<String>,
    },

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Empty file")]
    EmptyFile,

    #[error("Content does not match declared type {declared} (detected: {detected})")]
    ContentMismatch { declared: String, detected: String },

    #[error("Potentially malicious file: {0}")]
    MaliciousContent(String),
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::FileTooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            other => AppError::RejectedFile(other.to_string()),
        }
    }
}

/// Content types expected for a file extension, `None` for extensions that
/// are not photo or video formats.
fn expected_content_types(extension: &str) -> Option<&'static [&'static str]> {
    let types: &'static [&'static str] = match extension {
        "jpg" | "jpeg" => &["image/jpeg"],
        "png" => &["image/png"],
        "gif" => &["image/gif"],
        "webp" => &["image/webp"],
        "heic" => &["image/heic"],
        "heif" => &["image/heif"],
        "mp4" => &["video/mp4"],
        "m4v" => &["video/x-m4v", "video/mp4"],
        "mov" => &["video/quicktime"],
        "webm" => &["video/webm"],
        _ => return None,
    };
    Some(types)
}

const KNOWN_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "mp4", "m4v", "mov", "webm",
];

/// Canonical spelling of a content type.
fn normalize_content_type(content_type: &str) -> String {
    let lowered = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    match lowered.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => lowered,
    }
}

/// MP4, QuickTime and M4V share the ISO base media container; a phone
/// labelling one as another is not a spoof.
fn same_container_family(a: &str, b: &str) -> bool {
    const ISO_BMFF: &[&str] = &["video/mp4", "video/quicktime", "video/x-m4v"];
    a == b || (ISO_BMFF.contains(&a) && ISO_BMFF.contains(&b))
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Media file validator
///
/// Checks a staged file before it becomes site media: size against the
/// per-kind limit, extension and declared type against the allow-list, the
/// sniffed content against the declared type, and a few cheap heuristics
/// for disguised executables and scripts.
#[derive(Debug, Clone)]
pub struct MediaValidator {
    max_image_size: u64,
    max_video_size: u64,
    allowed_content_types: Vec<String>,
}

impl MediaValidator {
    pub fn new(
        max_image_size: u64,
        max_video_size: u64,
        allowed_content_types: Vec<String>,
    ) -> Self {
        Self {
            max_image_size,
            max_video_size,
            allowed_content_types: allowed_content_types
                .iter()
                .map(|ct| normalize_content_type(ct))
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_file_size_bytes() as u64,
            config.max_video_size_bytes() as u64,
            config.allowed_content_types().to_vec(),
        )
    }

    /// Extensions whose content types are on the allow-list.
    pub fn allowed_extensions(&self) -> Vec<String> {
        KNOWN_EXTENSIONS
            .iter()
            .filter(|ext| {
                expected_content_types(ext).is_some_and(|types| {
                    types
                        .iter()
                        .any(|t| self.allowed_content_types.iter().any(|a| a == t))
                })
            })
            .map(|ext| ext.to_string())
            .collect()
    }

    /// Size limit for a content type: videos get their own, larger limit.
    pub fn max_size_for(&self, content_type: &str) -> u64 {
        match MediaKind::from_mime(content_type) {
            MediaKind::Video => self.max_video_size,
            _ => self.max_image_size,
        }
    }

    /// Validate file size
    pub fn validate_file_size(&self, size: u64, content_type: &str) -> Result<(), ValidationError> {
        if size == 0 {
            return Err(ValidationError::EmptyFile);
        }

        let max = self.max_size_for(content_type);
        if size > max {
            return Err(ValidationError::FileTooLarge { size, max });
        }

        Ok(())
    }

    /// Validate file extension
    pub fn validate_extension(&self, filename: &str) -> Result<(), ValidationError> {
        let extension = extension_of(filename)
            .ok_or_else(|| ValidationError::InvalidFilename(filename.to_string()))?;

        let allowed = self.allowed_extensions();
        if !allowed.contains(&extension) {
            return Err(ValidationError::InvalidExtension { extension, allowed });
        }

        Ok(())
    }

    /// Validate content type
    pub fn validate_content_type(&self, content_type: &str) -> Result<(), ValidationError> {
        let normalized = normalize_content_type(content_type);

        if !self.allowed_content_types.iter().any(|ct| ct == &normalized) {
            return Err(ValidationError::InvalidContentType {
                content_type: content_type.to_string(),
                allowed: self.allowed_content_types.clone(),
            });
        }

        Ok(())
    }

    /// Validate that the declared content type matches the file extension
    pub fn validate_extension_content_type_match(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<(), ValidationError> {
        let extension = extension_of(filename)
            .ok_or_else(|| ValidationError::InvalidFilename(filename.to_string()))?;
        let normalized = normalize_content_type(content_type);

        let Some(expected) = expected_content_types(&extension) else {
            return Err(ValidationError::InvalidExtension {
                extension,
                allowed: self.allowed_extensions(),
            });
        };

        if !expected.iter().any(|ct| *ct == normalized) {
            return Err(ValidationError::InvalidContentType {
                content_type: format!(
                    "{} (does not match extension '{}'. Expected one of: {})",
                    content_type,
                    extension,
                    expected.join(", ")
                ),
                allowed: self.allowed_content_types.clone(),
            });
        }

        Ok(())
    }

    /// Compare the type sniffed from the file's leading bytes with the
    /// declared one. Unrecognisable content is a mismatch.
    pub fn validate_detected_type(
        &self,
        declared: &str,
        detected: Option<&str>,
    ) -> Result<(), ValidationError> {
        let declared = normalize_content_type(declared);
        let Some(detected) = detected.map(normalize_content_type) else {
            return Err(ValidationError::ContentMismatch {
                declared,
                detected: "unrecognised content".to_string(),
            });
        };

        if !same_container_family(&declared, &detected) {
            return Err(ValidationError::ContentMismatch { declared, detected });
        }

        Ok(())
    }

    /// Reject names hiding a dangerous extension, e.g. `invite.php.jpg`.
    pub fn validate_filename_safety(&self, filename: &str) -> Result<(), ValidationError> {
        let base = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(filename)
            .to_lowercase();

        if base.chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidFilename(filename.to_string()));
        }

        if let Some(ext) = base
            .split('.')
            .skip(1)
            .find(|segment| DANGEROUS_EXTENSIONS.contains(&segment.trim()))
        {
            return Err(ValidationError::MaliciousContent(format!(
                "file name contains a '.{}' extension",
                ext.trim()
            )));
        }

        Ok(())
    }

    /// Heuristic scan of the file's leading bytes.
    pub fn scan_content(&self, head: &[u8]) -> Result<(), ValidationError> {
        if let Some((_, what)) = EXECUTABLE_SIGNATURES
            .iter()
            .find(|(signature, _)| head.starts_with(signature))
        {
            return Err(ValidationError::MaliciousContent(format!(
                "content looks like a {}",
                what
            )));
        }

        let lowered = head.to_ascii_lowercase();
        if let Some(marker) = EMBEDDED_MARKERS.iter().find(|marker| {
            lowered
                .windows(marker.len())
                .any(|window| window == marker.as_bytes())
        }) {
            return Err(ValidationError::MaliciousContent(format!(
                "content embeds '{}'",
                marker
            )));
        }

        Ok(())
    }

    /// Validate every aspect of a staged file. `head` holds its leading
    /// bytes, enough for signature sniffing.
    pub fn validate_all(
        &self,
        filename: &str,
        content_type: &str,
        file_size: u64,
        head: &[u8],
    ) -> Result<(), ValidationError> {
        self.validate_filename_safety(filename)?;
        self.validate_file_size(file_size, content_type)?;
        self.validate_extension(filename)?;
        self.validate_content_type(content_type)?;
        self.validate_extension_content_type_match(filename, content_type)?;
        self.scan_content(head)?;
        let detected = infer::get(head).map(|kind| kind.mime_type());
        self.validate_detected_type(content_type, detected)?;
        Ok(())
    }
}
