//! Public entry point for code execution.
//!
//! The orchestrator is built once at startup. If the container runtime
//! cannot be reached it is built anyway, in the unavailable state, and every
//! execution short-circuits to a failed result without touching Docker.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::catalog::RuntimeCatalog;
use super::docker::DockerRuntime;
use super::engine::{EngineSettings, ExecutionEngine};
use super::gate::ConcurrencyGate;
use super::reaper::{Reaper, SweepReport};
use super::runtime::ContainerRuntime;
use super::{
    CodeExecutor, ExecutionPhase, ExecutionRequest, ExecutionResult, Language, PhaseReporter,
    PhaseUpdate,
};
use crate::config::SandboxConfig;
use crate::errors::SandboxError;

enum ServiceState {
    Available { engine: ExecutionEngine, reaper: Reaper },
    Unavailable { reason: String },
}

pub struct ExecutionOrchestrator {
    catalog: Arc<RuntimeCatalog>,
    gate: ConcurrencyGate,
    state: ServiceState,
}

impl ExecutionOrchestrator {
    /// Connect to the local Docker daemon. Configuration errors fail;
    /// an unreachable daemon yields an unavailable service.
    pub async fn connect(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let runtime = match DockerRuntime::connect() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("Failed to initialize Docker client: {}", e);
                return Self::unavailable(config, e.to_string());
            }
        };

        Self::start(config, Arc::new(runtime)).await
    }

    /// Build on top of an existing runtime, checking it answers and running
    /// the startup sweep when configured
    pub async fn start(
        config: &SandboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, SandboxError> {
        if let Err(e) = runtime.ping().await {
            log::error!("Container runtime is not reachable: {}", e);
            return Self::unavailable(config, e.to_string());
        }
        log::info!("Docker client initialized successfully");

        let orchestrator = Self::with_runtime(config, runtime)?;
        if config.reaper.sweep_on_startup {
            if let Err(e) = orchestrator.sweep().await {
                log::warn!("Startup sweep failed: {}", e);
            }
        }
        Ok(orchestrator)
    }

    /// Build on top of a runtime without contacting it
    pub fn with_runtime(
        config: &SandboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, SandboxError> {
        config.validate()?;
        let settings = EngineSettings::from_config(config)?;
        let foreign_grace = settings.container_lifetime(settings.default_timeout);
        let engine = ExecutionEngine::new(runtime.clone(), settings);
        let reaper = Reaper::new(runtime, engine.active_executions(), foreign_grace);

        Ok(Self {
            catalog: Arc::new(RuntimeCatalog::from_config(config)?),
            gate: ConcurrencyGate::new(config.execution.max_concurrent)?,
            state: ServiceState::Available { engine, reaper },
        })
    }

    /// A service that rejects every execution with `reason`
    pub fn unavailable(config: &SandboxConfig, reason: impl Into<String>) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self {
            catalog: Arc::new(RuntimeCatalog::from_config(config)?),
            gate: ConcurrencyGate::new(config.execution.max_concurrent)?,
            state: ServiceState::Unavailable {
                reason: reason.into(),
            },
        })
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, ServiceState::Available { .. })
    }

    pub fn catalog(&self) -> &RuntimeCatalog {
        &self.catalog
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn reaper(&self) -> Option<&Reaper> {
        match &self.state {
            ServiceState::Available { reaper, .. } => Some(reaper),
            ServiceState::Unavailable { .. } => None,
        }
    }

    /// Validate, admit and run one request
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        self.run_with_status(request, None).await
    }

    /// Like `run`, publishing phase transitions to `status` as they happen
    pub async fn run_with_status(
        &self,
        request: ExecutionRequest,
        status: Option<UnboundedSender<PhaseUpdate>>,
    ) -> Result<ExecutionResult, SandboxError> {
        request.validate()?;

        let engine = match &self.state {
            ServiceState::Available { engine, .. } => engine,
            ServiceState::Unavailable { reason } => {
                return Ok(ExecutionResult::failure(
                    SandboxError::RuntimeUnavailable(reason.clone()).to_string(),
                    Duration::ZERO,
                ));
            }
        };

        let reporter = PhaseReporter::new(Uuid::new_v4(), status);
        let runtime = self.catalog.get(request.language);

        reporter.emit(ExecutionPhase::Queued);
        let slot = match self.gate.acquire().await {
            Ok(slot) => slot,
            Err(e) => return Ok(ExecutionResult::failure(e.to_string(), Duration::ZERO)),
        };
        log::debug!(
            "Execution {} admitted ({}/{} slots in use)",
            reporter.execution_id(),
            self.gate.in_use(),
            self.gate.capacity()
        );

        let result = engine.execute(&request, &runtime, &reporter).await;
        drop(slot);
        Ok(result)
    }

    /// Convenience form taking a raw language tag
    pub async fn execute(
        &self,
        code: impl Into<String>,
        language: &str,
        timeout: Option<Duration>,
        workspace: Option<PathBuf>,
    ) -> Result<ExecutionResult, SandboxError> {
        let language: Language = self.catalog.resolve_language(language)?;
        let mut request = ExecutionRequest::new(code, language);
        request.timeout = timeout;
        request.external_workspace = workspace;
        self.run(request).await
    }

    /// Remove orphaned containers left by crashed or aborted executions
    pub async fn sweep(&self) -> Result<SweepReport, SandboxError> {
        match &self.state {
            ServiceState::Available { reaper, .. } => reaper.sweep().await,
            ServiceState::Unavailable { reason } => {
                Err(SandboxError::RuntimeUnavailable(reason.clone()))
            }
        }
    }
}

#[async_trait]
impl CodeExecutor for ExecutionOrchestrator {
    async fn execute_code(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        self.run(request).await
    }
}
