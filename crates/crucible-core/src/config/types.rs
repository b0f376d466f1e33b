//! Configuration type definitions for the execution service
//!
//! Every field has a default, so an empty YAML document is a valid
//! configuration. Resource limits are applied to each container at start
//! time and enforced by the Docker daemon.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use crate::errors::SandboxError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub runtimes: HashMap<String, RuntimeOverride>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock limit applied when a request carries no timeout.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Capacity of the concurrency gate.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub unknown_language: UnknownLanguagePolicy,
    /// Parent directory for ephemeral workspaces; system temp dir when unset.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
}

/// What to do with a language tag the catalog does not know
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnknownLanguagePolicy {
    #[default]
    Reject,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling per container, e.g. "512m" or "2g".
    #[serde(default = "default_memory_limit")]
    pub memory: String,
    /// CPU quota per container, in cores.
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_true")]
    pub network_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub sweep_on_startup: bool,
    /// Period for background sweeps; disabled when unset.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

/// Per-language replacement for a catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeOverride {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    /// Command template; `{file}` is replaced with the source file name.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    4
}

fn default_stop_grace_secs() -> u64 {
    1
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_memory_limit() -> String {
    "2g".to_string()
}

fn default_cpus() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            stop_grace_secs: default_stop_grace_secs(),
            max_output_bytes: default_max_output_bytes(),
            unknown_language: UnknownLanguagePolicy::default(),
            workspace_root: None,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: default_memory_limit(),
            cpus: default_cpus(),
            network_enabled: true,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_on_startup: true,
            interval_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl ResourceLimits {
    /// Memory ceiling in bytes.
    pub fn memory_bytes(&self) -> Result<i64, SandboxError> {
        parse_memory_size(&self.memory)
    }

    /// CFS quota in microseconds per `CPU_PERIOD_MICROS` period.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpus * CPU_PERIOD_MICROS as f64) as i64
    }
}

pub const CPU_PERIOD_MICROS: i64 = 100_000;
/// Smallest CFS quota the Docker daemon accepts.
pub const MIN_CPU_QUOTA_MICROS: i64 = 1_000;

/// Parse Docker-style memory sizes: a number with an optional b/k/m/g suffix.
pub fn parse_memory_size(value: &str) -> Result<i64, SandboxError> {
    let trimmed = value.trim().to_ascii_lowercase();
    let trimmed = trimmed.strip_suffix('b').filter(|s| !s.is_empty()).unwrap_or(&trimmed);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024_i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };

    let amount: i64 = digits.trim().parse().map_err(|_| {
        SandboxError::ConfigError(format!("Invalid memory size '{}'", value))
    })?;

    amount
        .checked_mul(multiplier)
        .filter(|bytes| *bytes > 0)
        .ok_or_else(|| SandboxError::ConfigError(format!("Invalid memory size '{}'", value)))
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.execution.default_timeout_secs == 0 {
            return Err(SandboxError::ConfigError(
                "execution.default_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.execution.max_concurrent == 0 {
            return Err(SandboxError::ConfigError(
                "execution.max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.execution.max_output_bytes == 0 {
            return Err(SandboxError::ConfigError(
                "execution.max_output_bytes must be greater than 0".to_string(),
            ));
        }

        self.limits.memory_bytes()?;

        if !self.limits.cpus.is_finite() || !(self.limits.cpus > 0.0) {
            return Err(SandboxError::ConfigError(
                "limits.cpus must be a positive number".to_string(),
            ));
        }

        let quota = self.limits.cpu_quota();
        if quota < MIN_CPU_QUOTA_MICROS || quota == i64::MAX {
            return Err(SandboxError::ConfigError(format!(
                "limits.cpus {} is outside the range the container runtime accepts (minimum {})",
                self.limits.cpus,
                MIN_CPU_QUOTA_MICROS as f64 / CPU_PERIOD_MICROS as f64
            )));
        }

        if let Some(0) = self.reaper.interval_secs {
            return Err(SandboxError::ConfigError(
                "reaper.interval_secs must be greater than 0".to_string(),
            ));
        }

        for (language, runtime) in &self.runtimes {
            if let Some(image) = &runtime.image {
                if image.trim().is_empty() {
                    return Err(SandboxError::ConfigError(format!(
                        "Runtime '{}' image cannot be empty", language
                    )));
                }
            }
            if let Some(command) = &runtime.command {
                if command.is_empty() {
                    return Err(SandboxError::ConfigError(format!(
                        "Runtime '{}' command cannot be empty", language
                    )));
                }
            }
        }

        Ok(())
    }
}
