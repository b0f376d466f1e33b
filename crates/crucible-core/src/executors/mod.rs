//! Code execution environments for sandboxed runtime evaluation.
//!
//! Runs untrusted code inside short-lived Docker containers. A request is
//! admitted through a bounded gate, resolved to a language runtime, executed
//! with memory, CPU and network constraints under a wall-clock timeout, and
//! the container is removed on every exit path. Failures during execution
//! are reported through `ExecutionResult`, never as errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::errors::SandboxError;

pub mod catalog;
pub mod docker;
pub mod engine;
pub mod gate;
pub mod images;
pub mod orchestrator;
pub mod reaper;
pub mod runtime;
pub mod workspace;

pub use catalog::{LanguageRuntime, RuntimeCatalog};
pub use docker::DockerRuntime;
pub use engine::ExecutionEngine;
pub use gate::{ConcurrencyGate, GateSlot};
pub use orchestrator::ExecutionOrchestrator;
pub use reaper::{Reaper, SweepReport};
pub use runtime::{ContainerRuntime, ContainerSpec, ManagedContainer};

/// Supported source languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Java,
    Go,
    Rust,
    Ruby,
    Php,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Java,
        Language::Go,
        Language::Rust,
        Language::Ruby,
        Language::Php,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Java => "java",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Ruby => "ruby",
            Language::Php => "php",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "java" => Ok(Language::Java),
            "go" | "golang" => Ok(Language::Go),
            "rust" | "rs" => Ok(Language::Rust),
            "ruby" | "rb" => Ok(Language::Ruby),
            "php" => Ok(Language::Php),
            _ => Err(SandboxError::UnsupportedLanguage(s.to_string())),
        }
    }
}

/// One request to run a piece of code. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    /// Falls back to the configured default when unset.
    pub timeout: Option<Duration>,
    /// Host directory mounted read-write at `/data`.
    pub external_workspace: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            timeout: None,
            external_workspace: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.external_workspace = Some(workspace.into());
        self
    }

    /// Request-level checks; run before any resource is allocated.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.code.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("code cannot be empty".to_string()));
        }

        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(SandboxError::InvalidRequest(
                    "timeout must be greater than 0".to_string(),
                ));
            }
        }

        if let Some(workspace) = &self.external_workspace {
            if !workspace.is_absolute() {
                return Err(SandboxError::InvalidRequest(format!(
                    "workspace '{}' must be an absolute path",
                    workspace.display()
                )));
            }
            if !workspace.is_dir() {
                return Err(SandboxError::InvalidRequest(format!(
                    "workspace '{}' is not a directory",
                    workspace.display()
                )));
            }
        }

        Ok(())
    }
}

/// Terminal outcome of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Standard output and standard error, merged in arrival order.
    pub output: String,
    pub error: Option<String>,
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn completed(output: String, exit_code: i64, execution_time: Duration) -> Self {
        let success = exit_code == 0;
        Self {
            success,
            output,
            error: (!success).then(|| format!("Exit code: {}", exit_code)),
            execution_time,
            exit_code: Some(exit_code),
            timed_out: false,
        }
    }

    pub fn timed_out(output: String, timeout: Duration, execution_time: Duration) -> Self {
        Self {
            success: false,
            output,
            error: Some(format!("Execution timeout after {}s", timeout.as_secs_f64())),
            execution_time,
            exit_code: None,
            timed_out: true,
        }
    }

    pub fn failure(error: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            execution_time,
            exit_code: None,
            timed_out: false,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of one execution; `Cleaned` is the only terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Queued,
    Preparing,
    Pulling,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cleaned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseUpdate {
    pub execution_id: Uuid,
    pub phase: ExecutionPhase,
}

/// Publishes phase transitions for one execution to an optional channel
#[derive(Debug, Clone)]
pub struct PhaseReporter {
    execution_id: Uuid,
    sender: Option<UnboundedSender<PhaseUpdate>>,
}

impl PhaseReporter {
    pub fn new(execution_id: Uuid, sender: Option<UnboundedSender<PhaseUpdate>>) -> Self {
        Self {
            execution_id,
            sender,
        }
    }

    pub fn silent(execution_id: Uuid) -> Self {
        Self::new(execution_id, None)
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn emit(&self, phase: ExecutionPhase) {
        log::debug!("Execution {} entered phase {:?}", self.execution_id, phase);
        if let Some(sender) = &self.sender {
            // A dropped receiver only means nobody is watching anymore
            let _ = sender.send(PhaseUpdate {
                execution_id: self.execution_id,
                phase,
            });
        }
    }
}

/// Entry point used by the surrounding platform
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute_code(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError>;
}
