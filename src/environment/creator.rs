use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::runtime::Runtime;

use super::Environment;

/// Interpreters tried, in order, when none is configured.
const DEFAULT_INTERPRETERS: &[&str] = &["python3", "python"];

/// Creates (or resets) a virtual environment with the base interpreter's
/// `venv` module. A single attempt, no retries.
pub struct EnvironmentCreator<'a, R: Runtime, C: CommandRunner> {
    runtime: &'a R,
    runner: &'a C,
}

impl<'a, R: Runtime, C: CommandRunner> EnvironmentCreator<'a, R, C> {
    pub fn new(runtime: &'a R, runner: &'a C) -> Self {
        Self { runtime, runner }
    }

    /// Create an environment at `root`, which must be absolute.
    ///
    /// An existing environment at `root` is cleared and recreated. A
    /// directory that is not an environment is refused rather than wiped.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, root: &Path, python: Option<&str>) -> Result<Environment> {
        if let Some(parent) = root.parent() {
            if !parent.as_os_str().is_empty() && !self.runtime.is_dir(parent) {
                return Err(ProvisionError::creation(
                    root,
                    format!("parent directory {:?} does not exist", parent),
                ));
            }
        }

        let base = self.base_interpreter(root, python)?;
        debug!("Using base interpreter {:?}", base);

        let env = Environment::new(root);
        let reset = self.runtime.exists(root);
        if reset {
            if !self.runtime.is_dir(root) {
                return Err(ProvisionError::creation(root, "path exists and is not a directory"));
            }
            if !self.runtime.exists(&env.pyvenv_cfg()) {
                return Err(ProvisionError::creation(
                    root,
                    "directory exists and is not a Python environment, refusing to clear it",
                ));
            }
            info!("Resetting existing environment at {:?}", root);
        } else {
            info!("Creating environment at {:?}", root);
        }

        let mut command = CommandSpec::new(&base).args(["-m", "venv"]);
        if reset {
            command = command.arg("--clear");
        }
        let command = command.arg(root);

        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| ProvisionError::creation(root, format!("{:#}", e)))?;
        if !output.success {
            return Err(ProvisionError::creation(root, output.failure_reason()));
        }

        if !self.runtime.exists(&env.python()) {
            return Err(ProvisionError::creation(
                root,
                format!("interpreter missing at {:?} after creation", env.python()),
            ));
        }

        info!("Environment ready at {:?}", root);
        Ok(env)
    }

    fn base_interpreter(&self, root: &Path, python: Option<&str>) -> Result<PathBuf> {
        match python {
            Some(name) => self.runtime.which(name).ok_or_else(|| {
                ProvisionError::creation(root, format!("base interpreter {} not found", name))
            }),
            None => DEFAULT_INTERPRETERS
                .iter()
                .find_map(|name| self.runtime.which(name))
                .ok_or_else(|| {
                    ProvisionError::creation(root, "python3 or python not found in PATH")
                }),
        }
    }
}
