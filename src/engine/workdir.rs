//! Working directory and per-stream file layout.

use std::path::{Path, PathBuf};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::EngineError;
use crate::task::{ItemKey, ResumePlan};

/// Where a task keeps its stream files until they are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// The working directory.
    pub dir: PathBuf,
    /// One file per stream, in stream order.
    pub files: Vec<PathBuf>,
}

/// Directory name for `item`: a stable hash prefix plus a random suffix in
/// `1..=99`, so two sessions for the same item rarely collide.
#[must_use]
pub fn dir_name(item: &ItemKey) -> String {
    let digest = Sha256::digest(item.as_str().as_bytes());
    let suffix = rand::thread_rng().gen_range(1..=99);
    format!("{}_{suffix}", hex::encode(&digest[..8]))
}

/// Prepares (or reuses) the workspace of a task.
///
/// A resume plan's directory and files are reused as-is; otherwise a fresh
/// directory is created under `temp_root` and files are named
/// `<index>.<extension>`.
///
/// # Errors
///
/// [`EngineError::Workspace`] if the directory cannot be created.
pub async fn prepare(
    temp_root: &Path,
    item: &ItemKey,
    extensions: &[&str],
    plan: Option<&ResumePlan>,
) -> Result<Workspace, EngineError> {
    let dir = plan
        .and_then(|p| p.working_dir.clone())
        .unwrap_or_else(|| temp_root.join(dir_name(item)));

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| EngineError::Workspace {
            path: dir.clone(),
            source,
        })?;

    let files = match plan.and_then(|p| p.output_files.clone()) {
        Some(files) if files.len() == extensions.len() => files,
        _ => extensions
            .iter()
            .enumerate()
            .map(|(index, ext)| dir.join(format!("{index}.{ext}")))
            .collect(),
    };

    debug!(dir = %dir.display(), streams = files.len(), "workspace ready");
    Ok(Workspace { dir, files })
}

/// Removes the stream files and the working directory (best-effort).
pub async fn discard(workspace: &Workspace) {
    for file in &workspace.files {
        if let Err(e) = tokio::fs::remove_file(file).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %file.display(), error = %e, "failed to remove stream file");
        }
    }
    if let Err(e) = tokio::fs::remove_dir(&workspace.dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %workspace.dir.display(), error = %e, "failed to remove working directory");
    }
}
