//! Local store reconciliation.
//!
//! Removes local files whose key no longer appears in the bucket listing,
//! then prunes directories left empty. The root directory itself is kept.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::catalog::Listing;
use crate::emit;
use crate::metrics::events::LocalFilesDeleted;

/// Delete every file under `root` whose relative path is not a listed key.
///
/// Refuses to delete anything when the listing is truncated, since keys
/// beyond the limit would look deleted. Individual failures are logged and
/// skipped. Returns the number of files deleted.
pub async fn reconcile(root: &Path, listing: &Listing, target: &str) -> usize {
    if listing.truncated {
        warn!(
            target = %target,
            listed = listing.objects.len(),
            "Listing was truncated, skipping local file cleanup"
        );
        return 0;
    }

    let keys: HashSet<&str> = listing.objects.iter().map(|o| o.key.as_str()).collect();

    let files = match walk(root).await {
        Ok(files) => files,
        Err(e) => {
            warn!(target = %target, root = %root.display(), error = %e, "Failed to scan download directory");
            return 0;
        }
    };

    let mut deleted = 0;
    let mut touched_dirs = HashSet::new();
    for (path, relative) in files {
        if keys.contains(relative.as_str()) {
            continue;
        }

        info!(target = %target, path = %path.display(), "Deleting local file not in bucket");
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                deleted += 1;
                if let Some(parent) = path.parent() {
                    touched_dirs.insert(parent.to_path_buf());
                }
            }
            Err(e) => {
                warn!(target = %target, path = %path.display(), error = %e, "Failed to delete local file");
            }
        }
    }

    prune_empty_dirs(root, touched_dirs).await;

    if deleted > 0 {
        emit!(LocalFilesDeleted {
            count: deleted as u64,
            target: target.to_string(),
        });
    }

    deleted
}

/// Recursively collect regular files under `root` with their `/`-separated
/// relative paths.
async fn walk(root: &Path) -> io::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir == root => return Ok(files),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Some(relative) = relative_key(root, &path) {
                    files.push((path, relative));
                }
            }
        }
    }

    Ok(files)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

/// Remove now-empty directories from each touched directory up toward `root`.
async fn prune_empty_dirs(root: &Path, dirs: HashSet<PathBuf>) {
    // Deepest first so a parent sees its children already removed
    let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

    for dir in dirs {
        let mut current = Some(dir.as_path());
        while let Some(dir) = current {
            if dir == root || !dir.starts_with(root) {
                break;
            }
            // remove_dir fails on non-empty directories, which ends the climb
            if tokio::fs::remove_dir(dir).await.is_err() {
                break;
            }
            debug!(path = %dir.display(), "Removed empty directory");
            current = dir.parent();
        }
    }
}
