//! Completed-artifact store: where finished inbound files land.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::utils::atomic_write::atomic_write;

/// Reduce a (possibly adversarial) remote file name to one safe path
/// component.
///
/// Directory parts, `.` and `..` are dropped; only alphanumerics plus
/// `.`, `-`, `_` and space survive. Falls back to `"file"`.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|part| !part.is_empty() && !matches!(*part, "." | ".."))
        .next_back()
        .unwrap_or_default();

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_matches(|c| c == ' ' || c == '.');

    if safe.is_empty() { "file".to_string() } else { safe.to_string() }
}

/// `dir/name`, or `dir/stem (n).ext` for the first `n` not already taken.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Clones share one write lock, so saves running in parallel never race
/// for the same free name.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a completed file and return where it was stored.
    pub async fn save(&self, name: &str, data: Bytes) -> Result<PathBuf> {
        let dir = self.dir.clone();
        let name = sanitize_file_name(name);
        let size = data.len();

        let _guard = self.write_lock.lock().await;
        let path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating download dir {}", dir.display()))?;
            let path = unique_path(&dir, &name);
            atomic_write(&path, &data)?;
            Ok(path)
        })
        .await
        .context("artifact writer task panicked")??;

        info!(event = "file_saved", path = %path.display(), size, "Received file saved");
        Ok(path)
    }
}
