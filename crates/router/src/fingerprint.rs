//! Filesystem fingerprinting for undeclared-side-effect detection.
//!
//! A fingerprint is the recursive sorted list of `(relpath, size, mtime_ns)`
//! for every file under a root. Read-tier capabilities with
//! `side_effect_scope: none` are fingerprinted before and after invocation;
//! any divergence means the node wrote where it declared it would not.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// One `(relpath, size, mtime_ns)` triple per regular file, sorted by path.
pub type Fingerprint = Vec<(String, u64, u128)>;

/// Fingerprint the tree under `root`. `None` when the root does not exist.
/// Unreadable entries are skipped rather than failing the whole walk.
pub fn fingerprint_tree(root: &Path) -> Option<Fingerprint> {
    if !root.is_dir() {
        return None;
    }

    let mut items: Fingerprint = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            if !metadata.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let relpath = relative.to_string_lossy().replace('\\', "/");
            let mtime_ns = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|duration| duration.as_nanos())
                .unwrap_or(0);
            items.push((relpath, metadata.len(), mtime_ns));
        }
    }

    items.sort();
    Some(items)
}
