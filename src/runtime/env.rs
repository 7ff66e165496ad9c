//! Working directory and executable lookup.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn current_dir_impl(&self) -> Result<PathBuf> {
        env::current_dir().context("Failed to read current directory")
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn which_impl(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}
