//! Provisioning configuration.
//!
//! The defaults reproduce the fleet's fixed bootstrap: a `slave-env` root in
//! the working directory holding the latest `beanstalkc` and `boto`. A TOML
//! file can substitute the root, the base interpreter, the package index and
//! the dependency list.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ProvisionError, Result};
use crate::runtime::Runtime;

pub const DEFAULT_ROOT: &str = "slave-env";
pub const DEFAULT_DEPENDENCIES: &[&str] = &["beanstalkc", "boto"];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Environment root, relative paths resolve against the working directory
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Base interpreter (name on PATH or a path). Falls back to python3, then python.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,

    /// Package index passed to pip as --index-url
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,

    /// Upgrade pip itself before installing the dependencies
    #[serde(default)]
    pub upgrade_pip: bool,

    /// Installed in this order
    #[serde(default = "default_dependencies")]
    pub dependencies: Vec<DependencySpec>,
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_dependencies() -> Vec<DependencySpec> {
    DEFAULT_DEPENDENCIES
        .iter()
        .map(|name| DependencySpec::latest(name))
        .collect()
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            python: None,
            index_url: None,
            upgrade_pip: false,
            dependencies: default_dependencies(),
        }
    }
}

impl ProvisionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ProvisionConfig = toml::from_str(content)
            .map_err(|e| ProvisionError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        debug!("Loading configuration from {:?}", path);
        let bytes = runtime
            .read(path)
            .map_err(|e| ProvisionError::config(format!("{:#}", e)))?;
        let content = String::from_utf8(bytes).map_err(|_| {
            ProvisionError::config(format!("{:?} is not valid UTF-8", path))
        })?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| ProvisionError::config(e.to_string()))
    }

    /// Reject configurations the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ProvisionError::config("root must not be empty"));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep.normalized_name()) {
                return Err(ProvisionError::config(format!(
                    "dependency {} is listed more than once",
                    dep.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the configured root against a working directory.
    pub fn absolute_root(&self, cwd: &Path) -> PathBuf {
        if self.root.is_absolute() {
            self.root.clone()
        } else {
            cwd.join(&self.root)
        }
    }
}

/// One entry of the dependency list: a package name, optional extras and an
/// optional version constraint, e.g. `boto`, `boto[s3]==2.49.0` or
/// `beanstalkc>=0.4,<1`.
///
/// Environment markers (`; python_version < "3"`) are rejected: the list
/// is installed into a single environment on the current host, so every
/// entry must apply to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct DependencySpec {
    pub name: String,
    pub extras: Vec<String>,
    pub constraint: Option<String>,
}

impl DependencySpec {
    /// A dependency installed at its latest available version.
    pub fn latest(name: &str) -> Self {
        Self {
            name: name.to_string(),
            extras: Vec::new(),
            constraint: None,
        }
    }

    /// The argument handed to pip.
    pub fn requirement(&self) -> String {
        let mut requirement = self.name.clone();
        if !self.extras.is_empty() {
            requirement.push('[');
            requirement.push_str(&self.extras.join(","));
            requirement.push(']');
        }
        if let Some(constraint) = &self.constraint {
            requirement.push_str(constraint);
        }
        requirement
    }

    /// Canonical project name: lowercase with runs of `-`, `_` and `.`
    /// collapsed into a single `-`.
    pub fn normalized_name(&self) -> String {
        normalize_package_name(&self.name)
    }
}

pub fn normalize_package_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
                in_separator = true;
            }
        } else {
            normalized.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    normalized
}

impl FromStr for DependencySpec {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(s.len());
        let (name, rest) = s.split_at(split);

        let valid_edges = name
            .chars()
            .next()
            .zip(name.chars().last())
            .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
        if !valid_edges {
            return Err(ProvisionError::config(format!(
                "invalid dependency name in {:?}",
                s
            )));
        }

        if rest.contains(';') {
            return Err(ProvisionError::config(format!(
                "environment markers are not supported in {:?}",
                s
            )));
        }

        let mut rest = rest.trim();
        let mut extras = Vec::new();
        if let Some(after_bracket) = rest.strip_prefix('[') {
            let (list, after) = after_bracket.split_once(']').ok_or_else(|| {
                ProvisionError::config(format!("unclosed extras in {:?}", s))
            })?;
            for extra in list.split(',').map(str::trim) {
                let valid = !extra.is_empty()
                    && extra
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
                if !valid {
                    return Err(ProvisionError::config(format!(
                        "invalid extra {:?} in {:?}",
                        extra, s
                    )));
                }
                extras.push(extra.to_string());
            }
            rest = after.trim();
        }

        let constraint = if rest.is_empty() {
            None
        } else if rest.starts_with(['=', '<', '>', '!', '~']) {
            Some(rest.to_string())
        } else {
            return Err(ProvisionError::config(format!(
                "invalid version constraint in {:?}",
                s
            )));
        };

        Ok(Self {
            name: name.to_string(),
            extras,
            constraint,
        })
    }
}

impl TryFrom<String> for DependencySpec {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DependencySpec> for String {
    fn from(spec: DependencySpec) -> Self {
        spec.requirement()
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.requirement())
    }
}
