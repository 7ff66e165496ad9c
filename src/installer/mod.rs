//! Installs the dependency list into an environment, one package at a time.
//!
//! Each entry is an install-or-upgrade with pip. The first failure stops the
//! loop; packages installed before it stay in the environment.

use log::{debug, info};
use serde::Deserialize;

use crate::config::{DependencySpec, normalize_package_name};
use crate::environment::Environment;
use crate::error::{ProvisionError, Result};
use crate::process::{CommandRunner, CommandSpec};

/// A package present in the environment after installation.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

pub struct DependencyInstaller<'a, C: CommandRunner> {
    runner: &'a C,
    index_url: Option<String>,
}

impl<'a, C: CommandRunner> DependencyInstaller<'a, C> {
    pub fn new(runner: &'a C, index_url: Option<String>) -> Self {
        Self { runner, index_url }
    }

    /// `python -m pip` inside the environment, without prompts or self-update nags.
    fn pip(&self, env: &Environment) -> CommandSpec {
        CommandSpec::new(env.python())
            .args(["-m", "pip"])
            .args(["--disable-pip-version-check", "--no-input"])
            .current_dir(env.root())
    }

    fn install_command(&self, env: &Environment, requirement: &str) -> CommandSpec {
        let mut command = self.pip(env).args(["install", "--upgrade"]);
        if let Some(index_url) = &self.index_url {
            command = command.args(["--index-url", index_url.as_str()]);
        }
        command.arg(requirement)
    }

    /// Upgrade pip itself inside the environment.
    #[tracing::instrument(skip(self, env))]
    pub async fn upgrade_pip(&self, env: &Environment) -> Result<()> {
        info!("Upgrading pip");
        self.run_install(env, "pip").await
    }

    /// Install every dependency in order and report what ended up installed.
    #[tracing::instrument(skip(self, env, dependencies))]
    pub async fn install_all(
        &self,
        env: &Environment,
        dependencies: &[DependencySpec],
    ) -> Result<Vec<InstalledPackage>> {
        let mut installed = Vec::with_capacity(dependencies.len());
        for (index, dependency) in dependencies.iter().enumerate() {
            info!(
                "[{}/{}] Installing {}",
                index + 1,
                dependencies.len(),
                dependency
            );
            let package = self.install_one(env, dependency).await?;
            info!("Installed {} {}", package.name, package.version);
            installed.push(package);
        }
        Ok(installed)
    }

    #[tracing::instrument(skip(self, env))]
    pub async fn install_one(
        &self,
        env: &Environment,
        dependency: &DependencySpec,
    ) -> Result<InstalledPackage> {
        self.run_install(env, &dependency.requirement())
            .await
            .map_err(|e| match e {
                ProvisionError::InstallFailed { reason, .. } => {
                    ProvisionError::install(&dependency.name, reason)
                }
                other => other,
            })?;

        let wanted = dependency.normalized_name();
        self.list_installed(env)
            .await
            .map_err(|e| match e {
                ProvisionError::InstallFailed { reason, .. } => ProvisionError::install(
                    &dependency.name,
                    format!("pip list failed after installation: {}", reason),
                ),
                other => other,
            })?
            .into_iter()
            .find(|p| normalize_package_name(&p.name) == wanted)
            .ok_or_else(|| {
                ProvisionError::install(
                    &dependency.name,
                    "package not present in the environment after installation",
                )
            })
    }

    /// Packages currently installed in the environment, as reported by pip.
    #[tracing::instrument(skip(self, env))]
    pub async fn list_installed(&self, env: &Environment) -> Result<Vec<InstalledPackage>> {
        let command = self.pip(env).args(["list", "--format=json"]);
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| ProvisionError::install("pip", format!("{:#}", e)))?;
        if !output.success {
            return Err(ProvisionError::install("pip", output.failure_reason()));
        }
        parse_pip_list(&output.stdout)
    }

    async fn run_install(&self, env: &Environment, requirement: &str) -> Result<()> {
        let command = self.install_command(env, requirement);
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| ProvisionError::install(requirement, format!("{:#}", e)))?;
        debug!("pip output for {}:\n{}", requirement, output.stdout);
        if !output.success {
            return Err(ProvisionError::install(requirement, output.failure_reason()));
        }
        Ok(())
    }
}

/// Parse `pip list --format=json`. pip may print warnings around the JSON
/// document, so only the outermost array is read.
fn parse_pip_list(stdout: &str) -> Result<Vec<InstalledPackage>> {
    let json = match (stdout.find('['), stdout.rfind(']')) {
        (Some(start), Some(end)) if start < end => &stdout[start..=end],
        _ => {
            return Err(ProvisionError::install(
                "pip",
                "unexpected output from pip list",
            ));
        }
    };
    serde_json::from_str(json)
        .map_err(|e| ProvisionError::install("pip", format!("invalid pip list output: {}", e)))
}
