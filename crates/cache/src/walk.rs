//! Deterministic directory walks.
//!
//! Both the source catalog and the plain backend hash directory trees, so a
//! walk always returns relative paths in sorted order regardless of what the
//! filesystem hands back.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(PathBuf),
    Descend(PathBuf),
    Skip,
}

async fn process_entry(root: &Path, entry: DirEntry) -> Result<WalkEntry> {
    let path = entry.path();
    let file_type = entry.file_type().await.map_err(|e| ErrorKind::io(e, &path))?;
    if file_type.is_dir() {
        return Ok(WalkEntry::Descend(path));
    }
    if file_type.is_file() {
        let relative = path
            .strip_prefix(root)
            .or_raise(|| ErrorKind::Backend(format!("{} is not within {}", path.display(), root.display())))?;
        return Ok(WalkEntry::File(relative.to_path_buf()));
    }
    // Note: symlinks and other special files are not followed.
    Ok(WalkEntry::Skip)
}

/// Every regular file under `root` accepted by `keep`, as sorted paths
/// relative to `root`. A missing `root` walks as empty.
pub(crate) async fn files(root: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => exn::bail!(ErrorKind::io(err, &current)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::io(e, &current))? {
            match process_entry(root, entry).await? {
                WalkEntry::File(relative) if keep(&relative) => found.push(relative),
                WalkEntry::Descend(dir) => stack.push(dir),
                WalkEntry::File(_) | WalkEntry::Skip => {},
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for path in ["b/two.json", "a/one.json", "a/notes.txt", "zero.json"] {
            let path = dir.path().join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"{}").unwrap();
        }
        let found = files(dir.path(), |p| p.extension().is_some_and(|e| e == "json")).await.unwrap();
        assert_eq!(found, vec![
            PathBuf::from("a/one.json"),
            PathBuf::from("b/two.json"),
            PathBuf::from("zero.json")
        ]);
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(files(&dir.path().join("nope"), |_| true).await.unwrap().is_empty());
    }
}
