//! Error types for request validation and container execution failures
//!
//! Two layers exist. `SandboxError` is what callers of the orchestrator can
//! see: it covers request-level contract violations and service-level faults
//! detected before any container resources are allocated. `EngineError`
//! describes failures inside a single execution; the engine never returns it
//! to callers but folds it into a failed `ExecutionResult`.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Container runtime not available: {0}")]
    RuntimeUnavailable(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Docker operation failed: {0}")]
    DockerError(String),
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::IoError(err.to_string())
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        SandboxError::DockerError(err.to_string())
    }
}

// Failures inside one execution; always mapped into the result
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Bollard (Docker client) error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("Failed to pull image '{image}': {message}")]
    ImagePull { image: String, message: String },
    #[error("I/O error during execution: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not prepare workspace: {0}")]
    Workspace(String),
    #[error("Container runtime error: {0}")]
    Runtime(String),
}
