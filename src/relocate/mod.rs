//! Makes an environment relocatable.
//!
//! A freshly created environment hard-codes its absolute root in several
//! places. This module rewrites those references so the tree keeps working
//! after being copied elsewhere:
//!
//! - `shebang` - console scripts in `bin/` get a `/bin/sh` launcher that
//!   finds the interpreter next to the script
//! - `activate` - activation scripts compute the root from their own location
//! - `pyvenv.cfg` - the informational `command` line is dropped
//! - symlinks pointing inside the root become relative
//!
//! Every rewrite recognises its own output, so running the packager twice
//! leaves the environment unchanged.

mod activate;
mod shebang;

use anyhow::Context;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use crate::environment::Environment;
use crate::error::{ProvisionError, Result};
use crate::runtime::{Runtime, is_path_under, relative_symlink_path};

use activate::{ActivationRewrite, rewrite_activation};
use shebang::{ShebangRewrite, rewrite_shebang};

/// What a relocation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelocationReport {
    pub scripts_rewritten: usize,
    pub activation_scripts_rewritten: usize,
    pub config_lines_removed: usize,
    pub symlinks_rewritten: usize,
    /// Files that still mention the root but have no relocatable form
    pub skipped: Vec<PathBuf>,
}

impl RelocationReport {
    pub fn changed(&self) -> usize {
        self.scripts_rewritten
            + self.activation_scripts_rewritten
            + self.config_lines_removed
            + self.symlinks_rewritten
    }
}

pub struct RelocationPackager<'a, R: Runtime> {
    runtime: &'a R,
}

impl<'a, R: Runtime> RelocationPackager<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self { runtime }
    }

    #[tracing::instrument(skip(self, env), fields(root = ?env.root()))]
    pub fn make_relocatable(&self, env: &mut Environment) -> Result<RelocationReport> {
        if cfg!(windows) {
            return Err(ProvisionError::relocation(
                "relocation is not supported on this platform",
            ));
        }

        let root = env.root().to_path_buf();
        let root_str = root.to_str().ok_or_else(|| {
            ProvisionError::relocation(format!("environment path {:?} is not valid UTF-8", root))
        })?;
        let bin_dir = env.bin_dir();
        if !self.runtime.is_dir(&bin_dir) {
            return Err(ProvisionError::relocation(format!(
                "{:?} is missing, is this an environment?",
                bin_dir
            )));
        }

        info!("Making {:?} relocatable", root);
        let mut report = RelocationReport::default();

        let activation_scripts = self
            .activation_scripts(&bin_dir)
            .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;

        self.rewrite_scripts(&root, &bin_dir, &activation_scripts, &mut report)?;
        self.rewrite_activation_scripts(root_str, &activation_scripts, &mut report)?;
        self.rewrite_pyvenv_cfg(env, root_str, &mut report)?;
        self.relativize_symlinks(&root, &root, &mut report)
            .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;

        env.mark_relocatable();
        info!(
            "Relocation done: {} script(s), {} activation script(s), {} config line(s), {} symlink(s)",
            report.scripts_rewritten,
            report.activation_scripts_rewritten,
            report.config_lines_removed,
            report.symlinks_rewritten
        );
        Ok(report)
    }

    fn activation_scripts(&self, bin_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let dir = bin_dir
            .to_str()
            .context("bin directory is not valid UTF-8")?;
        let pattern = format!("{}/activate*", glob::Pattern::escape(dir));
        let mut scripts = self.runtime.glob(&pattern)?;
        scripts.retain(|p| !self.runtime.is_symlink(p) && !self.runtime.is_dir(p));
        Ok(scripts)
    }

    fn rewrite_scripts(
        &self,
        root: &Path,
        bin_dir: &Path,
        activation_scripts: &[PathBuf],
        report: &mut RelocationReport,
    ) -> Result<()> {
        let entries = self
            .runtime
            .read_dir(bin_dir)
            .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;

        for path in entries {
            let is_activation = activation_scripts
                .iter()
                .any(|a| a.file_name() == path.file_name());
            if is_activation || self.runtime.is_symlink(&path) || self.runtime.is_dir(&path) {
                continue;
            }

            let content = self
                .runtime
                .read(&path)
                .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;
            if is_native_executable(&content) {
                debug!("Skipping native executable {:?}", path);
                continue;
            }

            match rewrite_shebang(&content, root, bin_dir) {
                ShebangRewrite::Rewritten(new_content) => {
                    debug!("Rewriting shebang of {:?}", path);
                    self.replace_file(&path, &new_content)
                        .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;
                    report.scripts_rewritten += 1;
                }
                ShebangRewrite::Unchanged => {}
                ShebangRewrite::Unsupported(reason) => {
                    return Err(ProvisionError::relocation(format!(
                        "cannot rewrite {:?}: {}",
                        path, reason
                    )));
                }
            }
        }
        Ok(())
    }

    fn rewrite_activation_scripts(
        &self,
        root: &str,
        scripts: &[PathBuf],
        report: &mut RelocationReport,
    ) -> Result<()> {
        for path in scripts {
            let content = self
                .runtime
                .read(path)
                .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;
            let Ok(text) = String::from_utf8(content) else {
                debug!("Skipping non UTF-8 activation script {:?}", path);
                continue;
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            match rewrite_activation(&name, &text, root) {
                ActivationRewrite::Rewritten(new_text) => {
                    debug!("Rewriting activation script {:?}", path);
                    self.replace_file(path, new_text.as_bytes())
                        .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;
                    report.activation_scripts_rewritten += 1;
                }
                ActivationRewrite::Unchanged => {}
                ActivationRewrite::Unsupported => {
                    warn!(
                        "{:?} still refers to {} and has no relocatable form, leaving it as is",
                        path, root
                    );
                    report.skipped.push(path.clone());
                }
            }
        }
        Ok(())
    }

    fn rewrite_pyvenv_cfg(
        &self,
        env: &Environment,
        root: &str,
        report: &mut RelocationReport,
    ) -> Result<()> {
        let cfg = env.pyvenv_cfg();
        if !self.runtime.exists(&cfg) {
            debug!("No pyvenv.cfg at {:?}", cfg);
            return Ok(());
        }

        let content = self
            .runtime
            .read(&cfg)
            .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;
        let text = String::from_utf8_lossy(&content);

        let mut removed = 0;
        let kept: Vec<&str> = text
            .lines()
            .filter(|line| {
                let is_command = line
                    .split_once('=')
                    .is_some_and(|(key, value)| key.trim() == "command" && value.contains(root));
                if is_command {
                    removed += 1;
                }
                !is_command
            })
            .collect();

        if removed > 0 {
            let mut new_text = kept.join("\n");
            new_text.push('\n');
            self.replace_file(&cfg, new_text.as_bytes())
                .map_err(|e| ProvisionError::relocation(format!("{:#}", e)))?;
            report.config_lines_removed += removed;
        }
        Ok(())
    }

    /// Replace absolute symlinks that point inside `root` with relative ones.
    fn relativize_symlinks(
        &self,
        root: &Path,
        dir: &Path,
        report: &mut RelocationReport,
    ) -> anyhow::Result<()> {
        for path in self.runtime.read_dir(dir)? {
            if self.runtime.is_symlink(&path) {
                let target = self.runtime.read_link(&path)?;
                if !target.is_absolute() || !is_path_under(&target, root) {
                    continue;
                }
                let relative = relative_symlink_path(&path, &target).with_context(|| {
                    format!("cannot express {:?} relative to {:?}", target, path)
                })?;
                debug!("Relinking {:?} -> {:?}", path, relative);
                self.runtime.remove_symlink(&path)?;
                self.runtime.symlink(&relative, &path)?;
                report.symlinks_rewritten += 1;
            } else if self.runtime.is_dir(&path) {
                self.relativize_symlinks(root, &path, report)?;
            }
        }
        Ok(())
    }

    /// Write through a temporary sibling and rename, keeping the permission bits.
    fn replace_file(&self, path: &Path, contents: &[u8]) -> anyhow::Result<()> {
        let mode = self.runtime.permissions(path)?;
        let file_name = path
            .file_name()
            .context("path has no file name")?
            .to_string_lossy();
        let tmp_path = path.with_file_name(format!(".{}.relocating", file_name));

        let result = self
            .runtime
            .write(&tmp_path, contents)
            .and_then(|_| self.runtime.set_permissions(&tmp_path, mode))
            .and_then(|_| self.runtime.rename(&tmp_path, path));
        if result.is_err() && self.runtime.exists(&tmp_path) {
            if let Err(e) = self.runtime.remove_file(&tmp_path) {
                warn!("Failed to remove {:?}: {:#}", tmp_path, e);
            }
        }
        result
    }
}

/// Whether `content` is a native executable (ELF, Mach-O or PE).
fn is_native_executable(content: &[u8]) -> bool {
    matches!(
        goblin::Object::parse(content),
        Ok(goblin::Object::Elf(_)) | Ok(goblin::Object::Mach(_)) | Ok(goblin::Object::PE(_))
    )
}
