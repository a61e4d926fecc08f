//! Locating the active log files
//!
//! The node writes `{root}/{session_start}/{date}/{height}`. Names at every
//! level sort lexicographically in time order, so the newest directory is
//! always the last one.

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{GatewayError, Result};

/// Fail unless `root` exists and can be listed
pub async fn check_root(root: &Path) -> Result<()> {
    let metadata = fs::metadata(root)
        .await
        .map_err(|e| GatewayError::LogRoot(format!("{}: {}", root.display(), e)))?;
    if !metadata.is_dir() {
        return Err(GatewayError::LogRoot(format!(
            "{} is not a directory",
            root.display()
        )));
    }
    fs::read_dir(root)
        .await
        .map_err(|e| GatewayError::LogRoot(format!("{}: {}", root.display(), e)))?;
    Ok(())
}

/// Lexicographically last subdirectory of `dir`
pub async fn latest_dir(dir: &Path) -> Result<Option<PathBuf>> {
    let mut dirs = entries(dir, true).await?;
    dirs.sort();
    Ok(dirs.pop())
}

/// Newest `{session}/{date}` directory under the root
pub async fn latest_leaf(root: &Path) -> Result<Option<PathBuf>> {
    let Some(session) = latest_dir(root).await? else {
        return Ok(None);
    };
    latest_dir(&session).await
}

/// Regular files of `dir` in ascending name order
pub async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = entries(dir, false).await?;
    files.sort();
    Ok(files)
}

async fn entries(dir: &Path, want_dirs: bool) -> Result<Vec<PathBuf>> {
    let mut reader = fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let file_type = entry.file_type().await?;
        let keep = if want_dirs {
            file_type.is_dir()
        } else {
            file_type.is_file()
        };
        if keep {
            found.push(entry.path());
        }
    }
    Ok(found)
}
