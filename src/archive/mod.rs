//! Bundles a relocatable environment into a gzip tarball.

use anyhow::{Context, Result as AnyResult};
use flate2::Compression;
use flate2::write::GzEncoder;
use log::{debug, info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;

use crate::environment::Environment;
use crate::error::{ProvisionError, Result};
use crate::runtime::{Runtime, is_path_under};

pub struct EnvironmentArchiver<'a, R: Runtime> {
    runtime: &'a R,
}

impl<'a, R: Runtime> EnvironmentArchiver<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self { runtime }
    }

    /// Write `env` to `dest` as a `.tar.gz` whose single top-level directory
    /// is named after the environment root. Symlinks are stored as links.
    #[tracing::instrument(skip(self, env), fields(root = ?env.root()))]
    pub fn pack(&self, env: &Environment, dest: &Path) -> Result<PathBuf> {
        if !env.is_relocatable() {
            return Err(ProvisionError::archive(
                "environment has not been made relocatable",
            ));
        }
        let dest = if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            let cwd = self
                .runtime
                .current_dir()
                .map_err(|e| ProvisionError::archive(format!("{:#}", e)))?;
            cwd.join(dest)
        };
        if is_path_under(&dest, env.root()) {
            return Err(ProvisionError::archive(format!(
                "archive {:?} would be written inside the environment",
                dest
            )));
        }
        let name = env
            .root()
            .file_name()
            .ok_or_else(|| ProvisionError::archive("environment root has no name"))?;

        info!("Archiving {:?} to {:?}", env.root(), dest);
        self.write_archive(env.root(), Path::new(name), &dest)
            .map_err(|e| ProvisionError::archive(format!("{:#}", e)))?;
        Ok(dest)
    }

    fn write_archive(&self, root: &Path, name: &Path, dest: &Path) -> AnyResult<()> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                self.runtime.create_dir_all(parent)?;
            }
        }

        let file_name = dest
            .file_name()
            .context("archive path has no file name")?
            .to_string_lossy();
        let tmp_path = dest.with_file_name(format!(".{}.tmp", file_name));
        debug!("Writing archive to {:?}", tmp_path);

        let result = write_tar_gz(root, name, &tmp_path)
            .and_then(|_| self.runtime.rename(&tmp_path, dest));
        if result.is_err() && self.runtime.exists(&tmp_path) {
            if let Err(e) = self.runtime.remove_file(&tmp_path) {
                warn!("Failed to remove {:?}: {:#}", tmp_path, e);
            }
        }
        result
    }
}

fn write_tar_gz(root: &Path, name: &Path, path: &Path) -> AnyResult<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(name, root)
        .with_context(|| format!("Failed to add {:?} to archive", root))?;
    builder
        .into_inner()
        .context("Failed to finish tar stream")?
        .finish()
        .context("Failed to finish gzip stream")?;
    Ok(())
}
