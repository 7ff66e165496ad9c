mod config;
mod provision;

pub use config::config;
pub use provision::{ProvisionOptions, provision};
