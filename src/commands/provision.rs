use anyhow::Result;
use log::{debug, info};
use std::path::PathBuf;

use crate::config::ProvisionConfig;
use crate::pipeline::{Pipeline, ProvisionSummary};
use crate::process::CommandRunner;
use crate::runtime::Runtime;

/// Overrides collected from the command line.
#[derive(Debug, Default, Clone)]
pub struct ProvisionOptions {
    pub config: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub archive: Option<PathBuf>,
}

/// Build the environment described by the configuration and print a summary.
#[tracing::instrument(skip(runtime, runner))]
pub async fn provision<R: Runtime, C: CommandRunner>(
    runtime: &R,
    runner: &C,
    options: ProvisionOptions,
) -> Result<ProvisionSummary> {
    let mut config = match &options.config {
        Some(path) => ProvisionConfig::load(runtime, path)?,
        None => ProvisionConfig::default(),
    };
    if let Some(root) = options.root {
        config.root = root;
    }
    config.validate()?;
    debug!("Effective configuration: {:?}", config);

    let mut pipeline = Pipeline::new(runtime, runner, config);
    if let Some(archive) = options.archive {
        pipeline = pipeline.with_archive(archive);
    }

    let summary = pipeline.run().await?;
    info!("Provisioned {:?}", summary.root);
    print_summary(&summary);
    Ok(summary)
}

fn print_summary(summary: &ProvisionSummary) {
    println!("Environment: {}", summary.root.display());
    for package in &summary.packages {
        println!("  {} {}", package.name, package.version);
    }
    println!(
        "Relocatable: {} script(s), {} activation script(s), {} symlink(s) rewritten",
        summary.relocation.scripts_rewritten,
        summary.relocation.activation_scripts_rewritten,
        summary.relocation.symlinks_rewritten
    );
    for skipped in &summary.relocation.skipped {
        println!("  not relocatable: {}", skipped.display());
    }
    if let Some(archive) = &summary.archive {
        println!("Archive: {}", archive.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use crate::process::MockCommandRunner;
    use crate::runtime::MockRuntime;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_provision_rejects_invalid_config_file() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_read()
            .with(eq(PathBuf::from("/etc/slave-env.toml")))
            .returning(|_| Ok(b"dependencies = [\"boto\", \"BOTO\"]\n".to_vec()));
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();

        let options = ProvisionOptions {
            config: Some(PathBuf::from("/etc/slave-env.toml")),
            ..Default::default()
        };
        let err = provision(&runtime, &runner, options).await.unwrap_err();
        let err = err.downcast::<ProvisionError>().unwrap();
        assert!(matches!(err, ProvisionError::Config { .. }));
    }

    #[tokio::test]
    async fn test_provision_root_override_is_used() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_current_dir()
            .returning(|| Ok(PathBuf::from("/work")));
        runtime
            .expect_is_dir()
            .with(eq(PathBuf::from("/opt")))
            .returning(|_| false);
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();

        let options = ProvisionOptions {
            root: Some(PathBuf::from("/opt/agent-env")),
            ..Default::default()
        };
        let err = provision(&runtime, &runner, options).await.unwrap_err();
        let err = err.downcast::<ProvisionError>().unwrap();
        match err {
            ProvisionError::CreationFailed { root, .. } => {
                assert_eq!(root, PathBuf::from("/opt/agent-env"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
