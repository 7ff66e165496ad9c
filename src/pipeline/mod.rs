//! The provisioning pipeline: create, install, make relocatable.
//!
//! Each stage is a transition of [`PipelineState`] and requires the state the
//! previous stage leaves behind. A failing stage stops the run and leaves the
//! environment as it is; nothing is rolled back.

mod state;

pub use state::PipelineState;

use log::info;
use std::path::PathBuf;

use crate::archive::EnvironmentArchiver;
use crate::config::ProvisionConfig;
use crate::environment::{Environment, EnvironmentCreator};
use crate::error::{ProvisionError, Result};
use crate::installer::{DependencyInstaller, InstalledPackage};
use crate::process::CommandRunner;
use crate::relocate::{RelocationPackager, RelocationReport};
use crate::runtime::Runtime;

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct ProvisionSummary {
    pub root: PathBuf,
    pub packages: Vec<InstalledPackage>,
    pub relocation: RelocationReport,
    pub archive: Option<PathBuf>,
}

pub struct Pipeline<'a, R: Runtime, C: CommandRunner> {
    runtime: &'a R,
    runner: &'a C,
    config: ProvisionConfig,
    archive: Option<PathBuf>,
    state: PipelineState,
    environment: Option<Environment>,
    installed: Vec<InstalledPackage>,
    relocation: RelocationReport,
}

impl<'a, R: Runtime, C: CommandRunner> Pipeline<'a, R, C> {
    pub fn new(runtime: &'a R, runner: &'a C, config: ProvisionConfig) -> Self {
        Self {
            runtime,
            runner,
            config,
            archive: None,
            state: PipelineState::Uninitialized,
            environment: None,
            installed: Vec::new(),
            relocation: RelocationReport::default(),
        }
    }

    /// Also write the relocatable environment to a tarball at `path`.
    pub fn with_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive = Some(path.into());
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    pub fn installed(&self) -> &[InstalledPackage] {
        &self.installed
    }

    /// Run every stage in order.
    #[tracing::instrument(skip(self))]
    pub async fn run(&mut self) -> Result<ProvisionSummary> {
        self.config.validate()?;

        self.create_environment().await?;
        self.install_dependencies().await?;
        self.make_relocatable()?;

        let env = self.current_environment(PipelineState::Relocatable)?;
        let archive = match &self.archive {
            Some(dest) => Some(EnvironmentArchiver::new(self.runtime).pack(env, dest)?),
            None => None,
        };

        Ok(ProvisionSummary {
            root: env.root().to_path_buf(),
            packages: self.installed.clone(),
            relocation: self.relocation.clone(),
            archive,
        })
    }

    /// `uninitialized -> created`
    #[tracing::instrument(skip(self))]
    pub async fn create_environment(&mut self) -> Result<()> {
        self.check_transition(PipelineState::Created)?;

        let cwd = self
            .runtime
            .current_dir()
            .map_err(|e| ProvisionError::creation(&self.config.root, format!("{:#}", e)))?;
        let root = self.config.absolute_root(&cwd);

        let env = EnvironmentCreator::new(self.runtime, self.runner)
            .create(&root, self.config.python.as_deref())
            .await?;
        self.environment = Some(env);
        self.advance(PipelineState::Created);
        Ok(())
    }

    /// `created -> dependencies-installed`
    #[tracing::instrument(skip(self))]
    pub async fn install_dependencies(&mut self) -> Result<()> {
        self.check_transition(PipelineState::DependenciesInstalled)?;
        let env = self.current_environment(PipelineState::DependenciesInstalled)?;

        let installer = DependencyInstaller::new(self.runner, self.config.index_url.clone());
        if self.config.upgrade_pip {
            installer.upgrade_pip(env).await?;
        }
        let installed = installer
            .install_all(env, &self.config.dependencies)
            .await?;

        self.installed = installed;
        self.advance(PipelineState::DependenciesInstalled);
        Ok(())
    }

    /// `dependencies-installed -> relocatable`
    #[tracing::instrument(skip(self))]
    pub fn make_relocatable(&mut self) -> Result<()> {
        self.check_transition(PipelineState::Relocatable)?;
        let env = self
            .environment
            .as_mut()
            .ok_or(ProvisionError::InvalidTransition {
                from: self.state,
                to: PipelineState::Relocatable,
            })?;

        self.relocation = RelocationPackager::new(self.runtime).make_relocatable(env)?;
        self.advance(PipelineState::Relocatable);
        Ok(())
    }

    fn check_transition(&self, to: PipelineState) -> Result<()> {
        if self.state.can_advance_to(to) {
            Ok(())
        } else {
            Err(ProvisionError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn current_environment(&self, to: PipelineState) -> Result<&Environment> {
        self.environment
            .as_ref()
            .ok_or(ProvisionError::InvalidTransition {
                from: self.state,
                to,
            })
    }

    fn advance(&mut self, to: PipelineState) {
        info!("Pipeline {} -> {}", self.state, to);
        self.state = to;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::DependencySpec;
    use crate::process::{CommandOutput, CommandSpec, MockCommandRunner};
    use crate::runtime::RealRuntime;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Arc, Mutex};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        config: ProvisionConfig,
    }

    fn fixture(dependencies: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let base = dir.path().join("python3");
        fs::write(&base, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&base, fs::Permissions::from_mode(0o755)).unwrap();

        let root = dir.path().join("slave-env");
        let config = ProvisionConfig {
            root: root.clone(),
            python: Some(base.to_string_lossy().into_owned()),
            dependencies: dependencies
                .iter()
                .map(|name| DependencySpec::latest(name))
                .collect(),
            ..ProvisionConfig::default()
        };
        Fixture {
            _dir: dir,
            root,
            config,
        }
    }

    /// Stand-in for the base interpreter and pip: lays out the environment on
    /// `-m venv`, fails installs of `doesnotexist123`, and reports every
    /// package installed so far on `pip list`.
    fn fake_python(root: PathBuf, calls: Arc<Mutex<Vec<String>>>) -> MockCommandRunner {
        let installed = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |cmd: &CommandSpec| {
            calls.lock().unwrap().push(cmd.to_string());
            let args: Vec<String> = cmd
                .args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect();

            if args.iter().any(|a| a == "venv") {
                let bin = root.join("bin");
                fs::create_dir_all(&bin).unwrap();
                fs::write(bin.join("python"), "#!/bin/sh\n").unwrap();
                fs::write(
                    bin.join("activate"),
                    format!("VIRTUAL_ENV=\"{}\"\nexport VIRTUAL_ENV\n", root.display()),
                )
                .unwrap();
                fs::write(
                    root.join("pyvenv.cfg"),
                    format!("home = /usr/bin\ncommand = /usr/bin/python3 -m venv {}\n", root.display()),
                )
                .unwrap();
                return Ok(CommandOutput::success(""));
            }

            if args.iter().any(|a| a == "list") {
                let packages: Vec<String> = installed
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|name| format!("{{\"name\": \"{}\", \"version\": \"1.0\"}}", name))
                    .collect();
                return Ok(CommandOutput::success(format!("[{}]", packages.join(", "))));
            }

            let package = args.last().cloned().unwrap_or_default();
            if package == "doesnotexist123" {
                return Ok(CommandOutput::failure(
                    1,
                    "ERROR: No matching distribution found for doesnotexist123",
                ));
            }
            fs::write(
                root.join("bin").join(format!("{}-cli", package)),
                format!("#!{}/bin/python\nimport {}\n", root.display(), package),
            )
            .unwrap();
            installed.lock().unwrap().push(package);
            Ok(CommandOutput::success(""))
        });
        runner
    }

    #[tokio::test]
    async fn test_run_provisions_default_dependencies() {
        let fixture = fixture(&["beanstalkc", "boto"]);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = fake_python(fixture.root.clone(), calls.clone());

        let mut pipeline = Pipeline::new(&RealRuntime, &runner, fixture.config.clone());
        let summary = pipeline.run().await.unwrap();

        assert_eq!(pipeline.state(), PipelineState::Relocatable);
        assert!(pipeline.environment().unwrap().is_relocatable());
        assert_eq!(summary.root, fixture.root);
        let names: Vec<&str> = summary.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["beanstalkc", "boto"]);
        assert_eq!(summary.relocation.scripts_rewritten, 2);
        assert_eq!(summary.relocation.activation_scripts_rewritten, 1);
        assert!(summary.archive.is_none());

        let installs: Vec<String> = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(" install "))
            .cloned()
            .collect();
        assert_eq!(installs.len(), 2);
        assert!(installs[0].ends_with("install --upgrade beanstalkc"));
        assert!(installs[1].ends_with("install --upgrade boto"));

        let root = fixture.root.to_string_lossy().into_owned();
        let script = fs::read_to_string(fixture.root.join("bin/boto-cli")).unwrap();
        assert!(!script.contains(&root));
    }

    #[test_log::test(tokio::test)]
    async fn test_run_halts_at_unresolvable_dependency() {
        let fixture = fixture(&["beanstalkc", "doesnotexist123", "boto"]);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = fake_python(fixture.root.clone(), calls.clone());

        let mut pipeline = Pipeline::new(&RealRuntime, &runner, fixture.config.clone());
        let err = pipeline.run().await.unwrap_err();

        match err {
            ProvisionError::InstallFailed { name, reason } => {
                assert_eq!(name, "doesnotexist123");
                assert!(reason.contains("No matching distribution"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(pipeline.state(), PipelineState::Created);
        assert!(!pipeline.environment().unwrap().is_relocatable());
        assert!(pipeline.installed().is_empty());

        // beanstalkc stays installed, boto is never attempted
        assert!(fixture.root.join("bin/beanstalkc-cli").exists());
        assert!(!fixture.root.join("bin/boto-cli").exists());
        assert!(!calls.lock().unwrap().iter().any(|c| c.ends_with(" boto")));

        // nothing was relocated
        let activate = fs::read_to_string(fixture.root.join("bin/activate")).unwrap();
        assert!(activate.contains(&fixture.root.to_string_lossy().into_owned()));
    }

    #[tokio::test]
    async fn test_run_with_archive() {
        let fixture = fixture(&["boto"]);
        let runner = fake_python(fixture.root.clone(), Arc::new(Mutex::new(Vec::new())));
        let dest = fixture.root.with_file_name("slave-env.tar.gz");

        let mut pipeline =
            Pipeline::new(&RealRuntime, &runner, fixture.config.clone()).with_archive(&dest);
        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.archive, Some(dest.clone()));
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_out_of_order_transitions_are_rejected() {
        let fixture = fixture(&["boto"]);
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();

        let mut pipeline = Pipeline::new(&RealRuntime, &runner, fixture.config.clone());
        let err = pipeline.make_relocatable().unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::InvalidTransition {
                from: PipelineState::Uninitialized,
                to: PipelineState::Relocatable,
            }
        ));

        let err = pipeline.install_dependencies().await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTransition { .. }));
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    #[tokio::test]
    async fn test_stages_cannot_repeat() {
        let fixture = fixture(&["boto"]);
        let runner = fake_python(fixture.root.clone(), Arc::new(Mutex::new(Vec::new())));

        let mut pipeline = Pipeline::new(&RealRuntime, &runner, fixture.config.clone());
        pipeline.create_environment().await.unwrap();
        let err = pipeline.create_environment().await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::InvalidTransition {
                from: PipelineState::Created,
                to: PipelineState::Created,
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_stops_before_creation() {
        let fixture = fixture(&["boto", "Boto"]);
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();

        let mut pipeline = Pipeline::new(&RealRuntime, &runner, fixture.config.clone());
        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Config { .. }));
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
        assert!(!fixture.root.exists());
    }
}
