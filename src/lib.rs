pub mod archive;
pub mod commands;
pub mod config;
pub mod environment;
pub mod error;
pub mod installer;
pub mod pipeline;
pub mod process;
pub mod relocate;
pub mod runtime;
