//! The isolated package environment and its on-disk layout.

mod creator;

pub use creator::EnvironmentCreator;

use std::path::{Path, PathBuf};

/// A virtual environment rooted at an absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    root: PathBuf,
    relocatable: bool,
}

impl Environment {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            relocatable: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the interpreter, console scripts and activation scripts.
    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.root.join("Scripts")
        } else {
            self.root.join("bin")
        }
    }

    pub fn python(&self) -> PathBuf {
        if cfg!(windows) {
            self.bin_dir().join("python.exe")
        } else {
            self.bin_dir().join("python")
        }
    }

    pub fn pyvenv_cfg(&self) -> PathBuf {
        self.root.join("pyvenv.cfg")
    }

    pub fn is_relocatable(&self) -> bool {
        self.relocatable
    }

    pub(crate) fn mark_relocatable(&mut self) {
        self.relocatable = true;
    }
}
