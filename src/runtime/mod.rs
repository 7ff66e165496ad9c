//! Runtime abstraction for system operations.
//!
//! Every filesystem access the provisioning stages make goes through the
//! [`Runtime`] trait so the stages can be exercised against a mock.
//!
//! # Structure
//!
//! - `path` - Path utility functions (normalize, is_path_under, relative_symlink_path)
//! - `env` - Working directory and executable lookup
//! - `fs` - File system operations (read, write, directory, permissions, glob)
//! - `symlink` - Symlink operations (create, read, remove)

mod env;
mod fs;
pub mod path;
mod symlink;

use anyhow::Result;
use std::path::{Path, PathBuf};

pub use path::{is_path_under, relative_symlink_path};

#[cfg_attr(test, mockall::automock)]
pub trait Runtime: Send + Sync {
    // Environment
    fn current_dir(&self) -> Result<PathBuf>;

    /// Look up an executable by name on `PATH`. Paths containing a separator
    /// are returned as-is when they point at an executable file.
    fn which(&self, name: &str) -> Option<PathBuf>;

    // File System
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Expand a glob pattern against the file system. Entries that cannot be
    /// read are skipped.
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Unix permission bits of a file. Always `0o644` on Windows.
    fn permissions(&self, path: &Path) -> Result<u32>;

    /// Set file permissions (mode) on Unix systems. No-op on Windows.
    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()>;

    // Symlinks
    fn is_symlink(&self, path: &Path) -> bool;
    fn read_link(&self, path: &Path) -> Result<PathBuf>;
    fn symlink(&self, original: &Path, link: &Path) -> Result<()>;
    fn remove_symlink(&self, path: &Path) -> Result<()>;
}

pub struct RealRuntime;

impl Runtime for RealRuntime {
    fn current_dir(&self) -> Result<PathBuf> {
        self.current_dir_impl()
    }

    fn which(&self, name: &str) -> Option<PathBuf> {
        self.which_impl(name)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.read_impl(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.write_impl(path, contents)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.rename_impl(from, to)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.remove_file_impl(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.create_dir_all_impl(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.exists_impl(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.is_dir_impl(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.read_dir_impl(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        self.glob_impl(pattern)
    }

    fn permissions(&self, path: &Path) -> Result<u32> {
        self.permissions_impl(path)
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<()> {
        self.set_permissions_impl(path, mode)
    }

    fn is_symlink(&self, path: &Path) -> bool {
        self.is_symlink_impl(path)
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        self.read_link_impl(path)
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        self.symlink_impl(original, link)
    }

    fn remove_symlink(&self, path: &Path) -> Result<()> {
        self.remove_symlink_impl(path)
    }
}
