//! Symlink operations (create, read, remove).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn symlink_impl(&self, original: &Path, link: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink as unix_symlink;
            unix_symlink(original, link).context("Failed to create symlink")?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::{symlink_dir, symlink_file};

            // `is_dir()` on a relative path is relative to CWD; we want it relative to the link's parent.
            let target_path = if original.is_absolute() {
                original.to_path_buf()
            } else {
                link.parent()
                    .context("Failed to get parent directory for symlink")?
                    .join(original)
            };

            if target_path.is_dir() {
                symlink_dir(original, link).context("Failed to create directory symlink")?;
            } else {
                symlink_file(original, link).context("Failed to create file symlink")?;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn read_link_impl(&self, path: &Path) -> Result<PathBuf> {
        fs::read_link(path).context("Failed to read symlink")
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn is_symlink_impl(&self, path: &Path) -> bool {
        fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_symlink_impl(&self, path: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            fs::remove_file(path).context("Failed to remove symlink")?;
        }
        #[cfg(windows)]
        {
            // Directory symlinks need remove_dir, file symlinks remove_file
            fs::remove_dir(path)
                .or_else(|_| fs::remove_file(path))
                .context("Failed to remove symlink")?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use crate::runtime::{RealRuntime, Runtime};
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn test_real_runtime_symlink_ops() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let target = dir.path().join("lib");
        runtime.create_dir_all(&target).unwrap();

        let link = dir.path().join("lib64");
        runtime.symlink(Path::new("lib"), &link).unwrap();
        assert!(runtime.is_symlink(&link));
        assert!(!runtime.is_symlink(&target));
        assert!(runtime.is_dir(&link));

        assert_eq!(runtime.read_link(&link).unwrap(), Path::new("lib"));

        runtime.remove_symlink(&link).unwrap();
        assert!(!runtime.exists(&link));
        assert!(runtime.exists(&target));
    }

    #[test]
    fn test_real_runtime_dangling_symlink() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let link = dir.path().join("dangling");
        runtime
            .symlink(&dir.path().join("missing"), &link)
            .unwrap();

        // exists() follows the link, is_symlink() does not
        assert!(!runtime.exists(&link));
        assert!(runtime.is_symlink(&link));
    }
}
