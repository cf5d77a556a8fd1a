use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// What a housekeeping pass did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HousekeepingReport {
    pub media_reset: bool,
    pub logs_truncated: Vec<PathBuf>,
    /// Failures hit during the pass; none of them stop the pass
    pub errors: Vec<String>,
}

/// Caps the media folder and the log files. Anything over its threshold is
/// reset wholesale: the folder is recreated empty, a log is truncated.
#[derive(Debug, Clone)]
pub struct Housekeeper {
    media_dir: PathBuf,
    log_files: Vec<PathBuf>,
    max_media_bytes: u64,
    max_log_bytes: u64,
}

impl Housekeeper {
    pub fn new(
        media_dir: &Path,
        log_files: &[&Path],
        max_media_bytes: u64,
        max_log_bytes: u64,
    ) -> Self {
        let mut logs: Vec<PathBuf> = Vec::new();
        for path in log_files {
            if !logs.iter().any(|p| p.as_path() == *path) {
                logs.push(path.to_path_buf());
            }
        }
        Self {
            media_dir: media_dir.to_path_buf(),
            log_files: logs,
            max_media_bytes,
            max_log_bytes,
        }
    }

    pub fn reset_storage_if_too_big(&self) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();

        match folder_size(&self.media_dir) {
            Ok(size) if size > self.max_media_bytes => {
                info!(
                    "Media folder {} is {} bytes (limit {}), resetting",
                    self.media_dir.display(),
                    size,
                    self.max_media_bytes
                );
                match reset_folder(&self.media_dir) {
                    Ok(()) => report.media_reset = true,
                    Err(e) => report.errors.push(format!("{:#}", e)),
                }
            }
            Ok(_) => {}
            Err(e) => report.errors.push(format!("{:#}", e)),
        }

        for log in &self.log_files {
            match file_size(log) {
                Ok(size) if size > self.max_log_bytes => {
                    info!(
                        "Log file {} is {} bytes (limit {}), truncating",
                        log.display(),
                        size,
                        self.max_log_bytes
                    );
                    match truncate_file(log) {
                        Ok(()) => report.logs_truncated.push(log.clone()),
                        Err(e) => report.errors.push(format!("{:#}", e)),
                    }
                }
                Ok(_) => {}
                Err(e) => report.errors.push(format!("{:#}", e)),
            }
        }

        for e in &report.errors {
            warn!("Housekeeping: {}", e);
        }
        report
    }
}

/// Total size of all regular files below `path`
pub fn folder_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry =
            entry.with_context(|| format!("Failed to walk folder: {}", path.display()))?;
        if entry.file_type().is_file() {
            let meta = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
            total += meta.len();
        }
    }
    Ok(total)
}

/// Size of a single file; a file that does not exist yet counts as empty
pub fn file_size(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

fn reset_folder(path: &Path) -> Result<()> {
    std::fs::remove_dir_all(path)
        .with_context(|| format!("Failed to delete folder: {}", path.display()))?;
    super::ensure_folder(path)
}

fn truncate_file(path: &Path) -> Result<()> {
    std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to truncate {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, len: usize) {
        std::fs::write(path, vec![b'x'; len]).unwrap();
    }

    #[test]
    fn test_folder_size_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a"), 10);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write(&dir.path().join("sub").join("b"), 15);

        assert_eq!(folder_size(dir.path()).unwrap(), 25);
    }

    #[test]
    fn test_folder_size_of_missing_folder_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(folder_size(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_oversized_media_folder_is_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        std::fs::create_dir(&media).unwrap();
        write(&media.join("Image_1.jpeg"), 64);
        write(&media.join("Image_2.jpeg"), 64);

        let keeper = Housekeeper::new(&media, &[], 100, 100);
        let report = keeper.reset_storage_if_too_big();

        assert!(report.media_reset);
        assert!(media.is_dir());
        assert_eq!(std::fs::read_dir(&media).unwrap().count(), 0);
    }

    #[test]
    fn test_media_folder_at_limit_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        std::fs::create_dir(&media).unwrap();
        write(&media.join("Image_1.jpeg"), 100);

        let report = Housekeeper::new(&media, &[], 100, 100).reset_storage_if_too_big();

        assert!(!report.media_reset);
        assert!(media.join("Image_1.jpeg").exists());
    }

    #[test]
    fn test_oversized_log_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        std::fs::create_dir(&media).unwrap();
        let log = dir.path().join("message_log.txt");
        let small = dir.path().join("media_log.txt");
        write(&log, 200);
        write(&small, 20);

        let keeper = Housekeeper::new(&media, &[log.as_path(), small.as_path(), log.as_path()], 1000, 100);
        let report = keeper.reset_storage_if_too_big();

        assert_eq!(report.logs_truncated, vec![log.clone()]);
        assert_eq!(std::fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(std::fs::metadata(&small).unwrap().len(), 20);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_media_error_does_not_skip_log_check() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("message_log.txt");
        write(&log, 200);

        let keeper = Housekeeper::new(&dir.path().join("missing"), &[log.as_path()], 100, 100);
        let report = keeper.reset_storage_if_too_big();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.logs_truncated, vec![log.clone()]);
    }

    #[test]
    fn test_missing_log_counts_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_size(&dir.path().join("nope.txt")).unwrap(), 0);
    }
}
