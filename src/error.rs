use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::PipelineState;

/// Failure of one provisioning stage.
///
/// Stages never recover from these; the pipeline stops in whatever state it
/// reached and the error is surfaced to the caller.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Failed to create environment at {root:?}: {reason}")]
    CreationFailed { root: PathBuf, reason: String },

    #[error("Failed to install {name}: {reason}")]
    InstallFailed { name: String, reason: String },

    #[error("Failed to make environment relocatable: {reason}")]
    RelocationFailed { reason: String },

    #[error("Failed to archive environment: {reason}")]
    ArchiveFailed { reason: String },

    #[error("Cannot move pipeline from {from} to {to}")]
    InvalidTransition { from: PipelineState, to: PipelineState },
}

impl ProvisionError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        ProvisionError::Config {
            message: message.into(),
        }
    }

    pub(crate) fn creation(root: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ProvisionError::CreationFailed {
            root: root.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn install(name: impl Into<String>, reason: impl ToString) -> Self {
        ProvisionError::InstallFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn relocation(reason: impl ToString) -> Self {
        ProvisionError::RelocationFailed {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn archive(reason: impl ToString) -> Self {
        ProvisionError::ArchiveFailed {
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
