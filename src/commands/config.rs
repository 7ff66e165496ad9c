use anyhow::Result;
use std::path::Path;

use crate::config::ProvisionConfig;
use crate::runtime::Runtime;

/// Print a configuration as TOML: the built-in defaults with `generate`,
/// otherwise the effective configuration loaded from `path`.
#[tracing::instrument(skip(runtime))]
pub fn config<R: Runtime>(runtime: &R, generate: bool, path: Option<&Path>) -> Result<String> {
    let config = match path {
        Some(path) if !generate => ProvisionConfig::load(runtime, path)?,
        _ => ProvisionConfig::default(),
    };
    let rendered = config.to_toml()?;
    print!("{}", rendered);
    Ok(rendered)
}
