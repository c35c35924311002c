//! Plan worktree: a synced copy of the metadata tree root.
//!
//! Used as the working directory for guest-side operations so that tests
//! never mutate the original tree. The sync excludes `.git`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Directory entries never copied into a worktree.
const EXCLUDED: [&str; 1] = [".git"];

/// Sync `source` into `destination`, creating it if needed.
///
/// Existing files in the destination are overwritten; files removed from
/// the source since the last sync are left in place (the worktree is
/// private to one plan, stale leftovers only appear on resumed runs where
/// they are harmless).
pub fn sync(source: &Path, destination: &Path) -> Result<()> {
    debug!(source = %source.display(), destination = %destination.display(), "sync worktree");
    copy_directory(source, destination)
}

fn copy_directory(source: &Path, destination: &Path) -> Result<()> {
    fs::create_dir_all(destination)
        .with_context(|| format!("create directory {}", destination.display()))?;
    let entries = fs::read_dir(source)
        .with_context(|| format!("read directory {}", source.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", source.display()))?;
        let name = entry.file_name();
        if EXCLUDED.iter().any(|excluded| name == *excluded) {
            continue;
        }
        let source_path = entry.path();
        let destination_path = destination.join(&name);
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", source_path.display()))?;
        if file_type.is_dir() {
            copy_directory(&source_path, &destination_path)?;
        } else if file_type.is_file() {
            fs::copy(&source_path, &destination_path).with_context(|| {
                format!(
                    "copy {} to {}",
                    source_path.display(),
                    destination_path.display()
                )
            })?;
        }
        // Symlinks and special files are skipped.
    }
    Ok(())
}
