//! Shared helpers for the `nuptia` binary: logging setup, database wiring
//! and output formatting.

pub mod setup;

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing. `log_format` is `json` for JSON lines, anything else
/// gives compact human-readable output.
pub fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "nuptia=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    }
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

/// Content type of a local file: sniffed from its bytes, falling back to
/// the extension for formats without a magic number.
pub fn guess_content_type(path: &Path, data: &[u8]) -> String {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type().to_string();
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_is_sniffed_before_extension() {
        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
        assert_eq!(guess_content_type(Path::new("photo.jpg"), png), "image/png");
    }

    #[test]
    fn content_type_falls_back_to_extension() {
        assert_eq!(guess_content_type(Path::new("clip.MOV"), b"????"), "video/quicktime");
        assert_eq!(
            guess_content_type(Path::new("notes.txt"), b"hello"),
            "application/octet-stream"
        );
    }
}
