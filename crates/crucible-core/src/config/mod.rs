//! Configuration module for the execution service
//!
//! Supports YAML configuration files with `CRUCIBLE_*` environment
//! overrides layered on top of built-in defaults.

pub mod types;
pub mod loader;

pub use types::*;
pub use loader::*;


use crate::errors::SandboxError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
    ConfigLoader::from_file(path).await
}

/// Validate a configuration
pub fn validate_config(config: &SandboxConfig) -> Result<(), SandboxError> {
    config.validate()
}
