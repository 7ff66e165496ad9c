//! Path utility functions for normalization and comparison.

use std::path::{Component, Path, PathBuf};

/// Normalize a path by processing `.` and `..` components lexically.
/// This does not access the filesystem and does not follow symlinks.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    // Nothing left to pop (e.g. at root), keep the `..`
                    result.push(component);
                }
            }
            _ => {
                result.push(component);
            }
        }
    }
    result
}

/// Check if a path is under a given directory by comparing normalized path components.
/// Returns true if `path` is under `dir` (i.e., `dir` is a prefix of `path`).
///
/// `/work/slave-env/bin/../../etc` is NOT under `/work/slave-env`, and
/// `/work/slave-env2` is not under `/work/slave-env` either.
pub fn is_path_under(path: &Path, dir: &Path) -> bool {
    let normalized_path = normalize_path(path);
    let normalized_dir = normalize_path(dir);

    let path_components: Vec<_> = normalized_path.components().collect();
    let dir_components: Vec<_> = normalized_dir.components().collect();

    if path_components.len() < dir_components.len() {
        return false;
    }

    dir_components
        .iter()
        .zip(path_components.iter())
        .all(|(d, p)| d == p)
}

/// Calculate the relative path from a symlink location to a target.
///
/// For a link at `/work/slave-env/lib64` pointing to `/work/slave-env/lib`,
/// this returns `lib`.
///
/// Returns `None` if a relative path cannot be computed (e.g., different drive letters on Windows).
pub fn relative_symlink_path(from_link: &Path, to_target: &Path) -> Option<PathBuf> {
    let from_dir = from_link.parent()?;
    let result = pathdiff::diff_paths(normalize_path(to_target), normalize_path(from_dir))?;

    if result.is_absolute() {
        return None;
    }

    Some(result)
}
