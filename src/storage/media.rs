use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory of downloaded media files
#[derive(Debug, Clone)]
pub struct MediaStore {
    dir: PathBuf,
}

impl MediaStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Write `content` under the base name of `file_name`. An existing file
    /// is never overwritten; a `_1`, `_2`, ... suffix is added instead.
    pub fn store(&self, file_name: &str, content: &[u8]) -> Result<PathBuf> {
        let base = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .context("Media file name is empty")?;

        let mut attempt = 0u32;
        loop {
            let path = self.dir.join(numbered(base, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(content)
                        .with_context(|| format!("Could not write to file '{}'", path.display()))?;
                    file.sync_all()
                        .with_context(|| format!("Could not close file '{}'", path.display()))?;
                    debug!("Stored {} bytes at {}", content.len(), path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Could not open file '{}'", path.display()))
                }
            }
        }
    }
}

/// `Image_x.jpeg` with n=2 becomes `Image_x_2.jpeg`
fn numbered(base: &str, n: u32) -> String {
    if n == 0 {
        return base.to_string();
    }
    match base.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &base[..dot], n, &base[dot..]),
        _ => format!("{}_{}", base, n),
    }
}
