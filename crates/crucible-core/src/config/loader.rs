//! Configuration loader for YAML files and environment overrides
//!
//! Values are resolved in three layers: built-in defaults, the YAML
//! document, then `CRUCIBLE_*` environment variables. The merged result is
//! validated before it is returned.

use crate::config::types::*;
use crate::errors::SandboxError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const ENV_EXECUTION_TIMEOUT: &str = "CRUCIBLE_EXECUTION_TIMEOUT";
pub const ENV_MEMORY_LIMIT: &str = "CRUCIBLE_MEMORY_LIMIT";
pub const ENV_CPU_LIMIT: &str = "CRUCIBLE_CPU_LIMIT";
pub const ENV_NETWORK_ENABLED: &str = "CRUCIBLE_NETWORK_ENABLED";
pub const ENV_MAX_CONCURRENT: &str = "CRUCIBLE_MAX_CONCURRENT";
pub const ENV_WORKSPACE_ROOT: &str = "CRUCIBLE_WORKSPACE_ROOT";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            SandboxError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<SandboxConfig, SandboxError> {
        let mut config: SandboxConfig = if content.trim().is_empty() {
            SandboxConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                SandboxError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<SandboxConfig, SandboxError> {
        let mut config = SandboxConfig::default();
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut SandboxConfig) -> Result<(), SandboxError> {
        if let Some(timeout) = Self::env_parsed::<u64>(ENV_EXECUTION_TIMEOUT)? {
            config.execution.default_timeout_secs = timeout;
        }

        if let Ok(memory) = env::var(ENV_MEMORY_LIMIT) {
            config.limits.memory = memory;
        }

        if let Some(cpus) = Self::env_parsed::<f64>(ENV_CPU_LIMIT)? {
            config.limits.cpus = cpus;
        }

        if let Ok(value) = env::var(ENV_NETWORK_ENABLED) {
            config.limits.network_enabled = parse_bool(ENV_NETWORK_ENABLED, &value)?;
        }

        if let Some(max) = Self::env_parsed::<usize>(ENV_MAX_CONCURRENT)? {
            config.execution.max_concurrent = max;
        }

        if let Ok(root) = env::var(ENV_WORKSPACE_ROOT) {
            if !root.is_empty() {
                config.execution.workspace_root = Some(PathBuf::from(root));
            }
        }

        Ok(())
    }

    fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, SandboxError> {
        match env::var(key) {
            Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                SandboxError::ConfigError(format!("Invalid value for {}: '{}'", key, raw))
            }),
            Err(_) => Ok(None),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SandboxError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SandboxError::ConfigError(format!(
            "Invalid value for {}: '{}'",
            key, value
        ))),
    }
}
