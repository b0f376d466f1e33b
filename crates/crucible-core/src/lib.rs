//! Isolated, resource-bounded execution of untrusted code.
//!
//! Source code in one of several supported languages is written into a
//! throwaway workspace, run inside a short-lived Docker container with
//! memory, CPU and network limits under a wall-clock timeout, and the
//! combined output is returned as an `ExecutionResult`.
//!
//! # Architecture Overview
//!
//! - **Runtime catalog**: maps language tags to container images and run commands
//! - **Concurrency gate**: bounds how many executions hold a container at once
//! - **Execution engine**: one container lifecycle per request, torn down on every path
//! - **Orchestrator**: the public entry point, validating and admitting requests
//! - **Reaper**: removes orphaned containers left by crashes or failed removals
//! - **Configuration system**: YAML files with environment overrides

pub mod config;
pub mod errors;
pub mod executors;

pub use config::{ConfigLoader, SandboxConfig};
pub use errors::SandboxError;
pub use executors::{
    CodeExecutor, ExecutionOrchestrator, ExecutionPhase, ExecutionRequest, ExecutionResult,
    Language, PhaseUpdate,
};

#[cfg(test)]
pub mod test_utils;
