const MAX_FILENAME_LEN: usize = 255;

/// Reduce a client-supplied name to a safe display name: basename only,
/// anything outside `[A-Za-z0-9._-]` replaced by `_`.
pub fn sanitize_filename(filename: &str) -> String {
    let base = std::path::Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);
    if base.contains("..") {
        return "invalid_filename".to_string();
    }
    let s: String = base
        .chars()
        .take(MAX_FILENAME_LEN)
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if s.trim_matches('_').is_empty() || s.len() < 3 {
        "file".to_string()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_plain_names() {
        assert_eq!(sanitize_filename("first-dance_01.jpg"), "first-dance_01.jpg");
    }

    #[test]
    fn strips_directories() {
        assert_eq!(sanitize_filename("/home/guest/Photos/cake.png"), "cake.png");
    }

    #[test]
    fn replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("our day (1).jpg"), "our_day__1_.jpg");
    }

    #[test]
    fn rejects_traversal_and_empty_names() {
        assert_eq!(sanitize_filename("a..b.jpg"), "invalid_filename");
        assert_eq!(sanitize_filename("??"), "file");
    }
}
