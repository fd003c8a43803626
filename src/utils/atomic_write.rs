//! Atomic file write utility.
//!
//! Received files are written next to their target as `<name>.part` and
//! renamed into place, so a half-written file never shows up under its
//! final name. `rename()` is atomic when both paths are on the same mount.

use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::error;

/// Temp path used while `path` is being written.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Atomically write `content` to `path` via a temporary file and rename.
///
/// On rename failure the temp file is removed.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = part_path(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("peerdrop_atomic_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_creates_parent_and_file() {
        let dir = scratch("create");
        let path = dir.join("nested").join("photo.jpg");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(!part_path(&path).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_overwrites() {
        let dir = scratch("overwrite");
        let path = dir.join("a.bin");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_part_path_keeps_extension() {
        assert_eq!(part_path(Path::new("/d/report.tar.gz")), Path::new("/d/report.tar.gz.part"));
        assert_eq!(part_path(Path::new("noext")), Path::new("noext.part"));
    }
}
