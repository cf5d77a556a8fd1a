pub mod housekeeper;
pub mod log;
pub mod media;

use anyhow::{Context, Result};
use std::path::Path;

pub use housekeeper::Housekeeper;
pub use self::log::{RecordKind, RecordLog};
pub use media::MediaStore;

/// Extension for a stored media file: `"image/jpeg"` becomes `".jpeg"`.
///
/// Parameters such as `; codecs=opus` are dropped. Anything without a
/// subtype maps to `".unknown"`.
pub fn file_extension_from_mime_type(mime_type: &str) -> String {
    let subtype = mime_type
        .split('/')
        .nth(1)
        .map(|s| s.split(';').next().unwrap_or("").trim())
        .unwrap_or("");

    if subtype.is_empty() {
        return ".unknown".to_string();
    }

    format!(".{}", subtype)
}

/// Create `path` (and its parents) if it does not exist yet
pub fn ensure_folder(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create folder: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_from_mime_type() {
        assert_eq!(file_extension_from_mime_type("a/b"), ".b");
        assert_eq!(file_extension_from_mime_type("image/jpeg"), ".jpeg");
        assert_eq!(file_extension_from_mime_type("audio/ogg; codecs=opus"), ".ogg");
        assert_eq!(file_extension_from_mime_type("a/b/c"), ".b");
    }

    #[test]
    fn test_extension_without_slash_is_unknown() {
        assert_eq!(file_extension_from_mime_type("jpeg"), ".unknown");
        assert_eq!(file_extension_from_mime_type(""), ".unknown");
        assert_eq!(file_extension_from_mime_type("image/"), ".unknown");
    }

    #[test]
    fn test_ensure_folder_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media").join("nested");

        ensure_folder(&media).unwrap();
        assert!(media.is_dir());
        ensure_folder(&media).unwrap();
        assert!(media.is_dir());
    }
}
