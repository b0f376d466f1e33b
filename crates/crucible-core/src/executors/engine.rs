//! Drives a single execution from workspace preparation to teardown.
//!
//! Order of operations: prepare the workspace, make sure the image is
//! present, create and start the container, wait for it under the request
//! timeout, capture output, then remove the container and the workspace.
//! Removal happens on every path; if the surrounding future is dropped
//! mid-flight the container handle schedules its own removal.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::catalog::LanguageRuntime;
use super::images::ImageCache;
use super::runtime::{
    unix_now, ContainerRuntime, ContainerSpec, EXECUTION_LABEL, EXPIRES_LABEL, INSTANCE_LABEL,
    MANAGED_LABEL,
};
use super::workspace::EphemeralWorkspace;
use super::{ExecutionPhase, ExecutionRequest, ExecutionResult, PhaseReporter};
use crate::config::{SandboxConfig, CPU_PERIOD_MICROS};
use crate::errors::{EngineError, SandboxError};

const CONTAINER_WORKDIR: &str = "/workspace";
const EXTERNAL_MOUNT: &str = "/data";
const CONTAINER_NAME_PREFIX: &str = "crucible-exec-";
/// Allowance past timeout and stop grace for log capture and removal
const EXPIRY_SLACK: Duration = Duration::from_secs(30);

/// Resolved, validated limits applied to every container
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_timeout: Duration,
    pub stop_grace: Duration,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub network_enabled: bool,
    pub max_output_bytes: usize,
    pub workspace_root: Option<PathBuf>,
}

impl EngineSettings {
    pub fn from_config(config: &SandboxConfig) -> Result<Self, SandboxError> {
        Ok(Self {
            default_timeout: config.execution.default_timeout(),
            stop_grace: config.execution.stop_grace(),
            memory_bytes: config.limits.memory_bytes()?,
            cpu_quota: config.limits.cpu_quota(),
            network_enabled: config.limits.network_enabled,
            max_output_bytes: config.execution.max_output_bytes,
            workspace_root: config.execution.workspace_root.clone(),
        })
    }

    /// How long a container running under `timeout` may legitimately exist
    pub fn container_lifetime(&self, timeout: Duration) -> Duration {
        timeout
            .saturating_add(self.stop_grace)
            .saturating_add(EXPIRY_SLACK)
    }
}

/// Execution ids that currently own a container, scoped to one service
/// instance. Containers are labelled with `instance_id` so other processes
/// sharing the daemon can tell them apart.
#[derive(Debug, Clone)]
pub struct ActiveExecutions {
    instance_id: String,
    ids: Arc<Mutex<HashSet<String>>>,
}

impl Default for ActiveExecutions {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveExecutions {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(execution_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn track(&self, execution_id: String) -> ActiveGuard {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id.clone());
        ActiveGuard {
            ids: self.ids.clone(),
            execution_id,
        }
    }
}

pub(crate) struct ActiveGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    execution_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.execution_id);
    }
}

/// Exclusive reference to one created container
struct EnvironmentHandle {
    id: String,
    runtime: Arc<dyn ContainerRuntime>,
    removed: bool,
}

impl EnvironmentHandle {
    fn new(id: String, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            id,
            runtime,
            removed: false,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn remove(mut self) -> Result<(), EngineError> {
        self.removed = true;
        self.runtime.remove_container(&self.id).await
    }
}

impl Drop for EnvironmentHandle {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        let id = std::mem::take(&mut self.id);
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Execution abandoned, removing container {} in background", id);
                handle.spawn(async move {
                    if let Err(e) = runtime.remove_container(&id).await {
                        log::warn!("Background removal of container {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => {
                log::warn!("No runtime to remove container {}; leaving it for the reaper", id);
            }
        }
    }
}

pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
    images: ImageCache,
    settings: EngineSettings,
    active: ActiveExecutions,
}

impl ExecutionEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: EngineSettings) -> Self {
        Self {
            runtime,
            images: ImageCache::new(),
            settings,
            active: ActiveExecutions::default(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn active_executions(&self) -> ActiveExecutions {
        self.active.clone()
    }

    /// Run one request to completion. Never fails: internal errors become a
    /// failed result.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        runtime: &LanguageRuntime,
        reporter: &PhaseReporter,
    ) -> ExecutionResult {
        let started = Instant::now();
        reporter.emit(ExecutionPhase::Preparing);

        let result = match self.run(request, runtime, reporter, started).await {
            Ok(result) => result,
            Err(e) => {
                log::error!(
                    "Sandbox execution {} failed: {}",
                    reporter.execution_id(),
                    e
                );
                ExecutionResult::failure(e.to_string(), started.elapsed())
            }
        };

        let outcome = if result.timed_out {
            ExecutionPhase::TimedOut
        } else if result.success {
            ExecutionPhase::Completed
        } else {
            ExecutionPhase::Failed
        };
        reporter.emit(outcome);
        reporter.emit(ExecutionPhase::Cleaned);

        log::info!(
            "Execution {} ({}) finished in {:.3}s: success={}",
            reporter.execution_id(),
            runtime.language,
            result.execution_time.as_secs_f64(),
            result.success
        );
        result
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        runtime: &LanguageRuntime,
        reporter: &PhaseReporter,
        started: Instant,
    ) -> Result<ExecutionResult, EngineError> {
        let workspace = EphemeralWorkspace::create(self.settings.workspace_root.as_deref()).await?;
        let filename = runtime.source_file_name();
        workspace.write_source(&filename, &request.code).await?;

        self.images
            .ensure(self.runtime.as_ref(), &runtime.image, reporter)
            .await?;

        let execution_id = reporter.execution_id().to_string();
        let _active = self.active.track(execution_id.clone());
        let timeout = request.timeout.unwrap_or(self.settings.default_timeout);
        let spec =
            self.container_spec(request, runtime, &workspace, &filename, &execution_id, timeout);

        let container_id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                // The image may have been removed behind our back
                self.images.forget(&runtime.image).await;
                return Err(e);
            }
        };
        let handle = EnvironmentHandle::new(container_id, self.runtime.clone());
        log::debug!("Created container {} for execution {}", handle.id(), execution_id);

        let outcome = self.supervise(&handle, timeout, reporter, started).await;

        let container_id = handle.id().to_string();
        if let Err(e) = handle.remove().await {
            log::warn!("Failed to remove container {}: {}", container_id, e);
        }
        if let Err(e) = workspace.close() {
            log::warn!("{}", e);
        }

        outcome
    }

    async fn supervise(
        &self,
        handle: &EnvironmentHandle,
        timeout: Duration,
        reporter: &PhaseReporter,
        started: Instant,
    ) -> Result<ExecutionResult, EngineError> {
        let id = handle.id();
        self.runtime.start_container(id).await?;
        reporter.emit(ExecutionPhase::Running);

        match tokio::time::timeout(timeout, self.runtime.wait_container(id)).await {
            Ok(Ok(exit_code)) => {
                let output = self
                    .runtime
                    .container_logs(id, self.settings.max_output_bytes)
                    .await?;
                Ok(ExecutionResult::completed(output, exit_code, started.elapsed()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                log::warn!("Execution timed out for container {}", id);
                if let Err(e) = self.runtime.stop_container(id, self.settings.stop_grace).await {
                    log::warn!("Failed to stop container {}: {}", id, e);
                }
                let output = self
                    .runtime
                    .container_logs(id, self.settings.max_output_bytes)
                    .await
                    .unwrap_or_else(|e| {
                        log::warn!("Could not read logs of timed out container {}: {}", id, e);
                        String::new()
                    });
                Ok(ExecutionResult::timed_out(output, timeout, started.elapsed()))
            }
        }
    }

    fn container_spec(
        &self,
        request: &ExecutionRequest,
        runtime: &LanguageRuntime,
        workspace: &EphemeralWorkspace,
        filename: &str,
        execution_id: &str,
        timeout: Duration,
    ) -> ContainerSpec {
        let mut mounts = vec![(workspace.path().to_path_buf(), CONTAINER_WORKDIR.to_string())];
        if let Some(external) = &request.external_workspace {
            mounts.push((external.clone(), EXTERNAL_MOUNT.to_string()));
        }

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(EXECUTION_LABEL.to_string(), execution_id.to_string());
        labels.insert(INSTANCE_LABEL.to_string(), self.active.instance_id().to_string());
        let lifetime = self.settings.container_lifetime(timeout);
        let expires_at = unix_now().saturating_add(lifetime.as_secs().min(i64::MAX as u64) as i64);
        labels.insert(EXPIRES_LABEL.to_string(), expires_at.to_string());

        ContainerSpec {
            name: format!("{}{}", CONTAINER_NAME_PREFIX, execution_id),
            image: runtime.image.clone(),
            command: runtime.command_for(filename),
            working_dir: CONTAINER_WORKDIR.to_string(),
            mounts,
            memory_bytes: self.settings.memory_bytes,
            cpu_period: CPU_PERIOD_MICROS,
            cpu_quota: self.settings.cpu_quota,
            network_enabled: self.settings.network_enabled,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::catalog::RuntimeCatalog;
    use crate::executors::Language;
    use crate::test_utils::MockRuntime;

    fn engine_with(runtime: Arc<MockRuntime>) -> ExecutionEngine {
        let settings = EngineSettings::from_config(&SandboxConfig::default()).unwrap();
        ExecutionEngine::new(runtime, settings)
    }

    async fn run(engine: &ExecutionEngine, request: ExecutionRequest) -> ExecutionResult {
        let runtime = RuntimeCatalog::builtin().get(request.language);
        engine
            .execute(&request, &runtime, &PhaseReporter::silent(Uuid::new_v4()))
            .await
    }

    #[tokio::test]
    async fn test_successful_run_captures_output() {
        let mock = Arc::new(MockRuntime::new());
        let engine = engine_with(mock.clone());

        let result = run(&engine, ExecutionRequest::new("print hello", Language::Python)).await;

        assert!(result.success, "{:?}", result.error);
        assert!(result.output.contains("hello"));
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(mock.created_count(), 1);
        assert!(mock.all_removed_once());
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_code() {
        let mock = Arc::new(MockRuntime::new());
        let engine = engine_with(mock.clone());

        let code = "print SyntaxError: invalid syntax\nexit 1";
        let result = run(&engine, ExecutionRequest::new(code, Language::Python)).await;

        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.error.as_deref(), Some("Exit code: 1"));
        assert!(result.output.contains("SyntaxError"));
        assert!(mock.all_removed_once());
    }

    #[tokio::test]
    async fn test_timeout_stops_and_removes_container() {
        let mock = Arc::new(MockRuntime::new());
        let engine = engine_with(mock.clone());

        let request = ExecutionRequest::new("print started\nsleep 5000", Language::Python)
            .with_timeout(Duration::from_millis(100));
        let result = run(&engine, request).await;

        assert!(!result.success);
        assert!(result.timed_out);
        let error = result.error.unwrap();
        assert!(error.contains("timeout"));
        assert!(!error.contains("Exit code"));
        assert!(result.output.contains("started"));
        assert_eq!(mock.stop_count(), 1);
        assert!(mock.all_removed_once());
        assert_eq!(mock.running_count(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_still_removes_container() {
        let mock = Arc::new(MockRuntime::new().failing_start());
        let engine = engine_with(mock.clone());

        let result = run(&engine, ExecutionRequest::new("print hi", Language::Python)).await;

        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(mock.created_count(), 1);
        assert!(mock.all_removed_once());
    }

    #[tokio::test]
    async fn test_pull_failure_becomes_result() {
        let mock = Arc::new(MockRuntime::new().failing_pull("python:3.11-slim"));
        let engine = engine_with(mock.clone());

        let result = run(&engine, ExecutionRequest::new("print hi", Language::Python)).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("python:3.11-slim"));
        assert_eq!(mock.created_count(), 0);
    }

    #[tokio::test]
    async fn test_container_spec_applies_limits_and_mounts() {
        let mock = Arc::new(MockRuntime::new());
        let mut config = SandboxConfig::default();
        config.limits.memory = "256m".to_string();
        config.limits.cpus = 0.5;
        config.limits.network_enabled = false;
        let engine = ExecutionEngine::new(mock.clone(), EngineSettings::from_config(&config).unwrap());

        let external = tempfile::tempdir().unwrap();
        let request = ExecutionRequest::new("print x", Language::Python).with_workspace(external.path());
        let result = run(&engine, request).await;
        assert!(result.success);

        let spec = mock.last_spec().unwrap();
        assert_eq!(spec.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(spec.cpu_quota, 50_000);
        assert_eq!(spec.cpu_period, CPU_PERIOD_MICROS);
        assert!(!spec.network_enabled);
        assert_eq!(spec.working_dir, CONTAINER_WORKDIR);
        assert_eq!(spec.command, vec!["python", "main.py"]);
        assert_eq!(spec.mounts.len(), 2);
        assert_eq!(spec.mounts[1], (external.path().to_path_buf(), EXTERNAL_MOUNT.to_string()));
        assert_eq!(spec.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(
            spec.labels.get(INSTANCE_LABEL).map(String::as_str),
            Some(engine.active_executions().instance_id())
        );
        // Default timeout 300s, stop grace 1s, plus slack
        let expires: i64 = spec.labels[EXPIRES_LABEL].parse().unwrap();
        let lifetime = expires - unix_now();
        assert!((300..=331).contains(&lifetime), "lifetime was {}", lifetime);
        assert!(spec.name.starts_with(CONTAINER_NAME_PREFIX));

        // Workspace is gone once the call returns
        assert!(!spec.mounts[0].0.exists());
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let mock = Arc::new(MockRuntime::new());
        let mut config = SandboxConfig::default();
        config.execution.max_output_bytes = 16;
        let engine = ExecutionEngine::new(mock.clone(), EngineSettings::from_config(&config).unwrap());

        let code = "print aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let result = run(&engine, ExecutionRequest::new(code, Language::Python)).await;

        assert!(result.output.ends_with("[output truncated]"));
        assert!(result.output.len() < 64);
    }

    #[tokio::test]
    async fn test_phases_are_reported_in_order() {
        let mock = Arc::new(MockRuntime::new());
        let engine = engine_with(mock);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reporter = PhaseReporter::new(Uuid::new_v4(), Some(tx));
        let runtime = RuntimeCatalog::builtin().get(Language::Python);

        engine
            .execute(&ExecutionRequest::new("print hi", Language::Python), &runtime, &reporter)
            .await;
        drop(reporter);

        let mut phases = Vec::new();
        while let Some(update) = rx.recv().await {
            phases.push(update.phase);
        }
        assert_eq!(
            phases,
            vec![
                ExecutionPhase::Preparing,
                ExecutionPhase::Pulling,
                ExecutionPhase::Running,
                ExecutionPhase::Completed,
                ExecutionPhase::Cleaned,
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_execution_removes_container_in_background() {
        let mock = Arc::new(MockRuntime::new());
        let engine = Arc::new(engine_with(mock.clone()));

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                run(&engine, ExecutionRequest::new("sleep 10000", Language::Python)).await
            })
        };
        while mock.running_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.abort();
        let _ = task.await;

        for _ in 0..100 {
            if mock.all_removed_once() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(mock.all_removed_once());
        assert!(engine.active_executions().is_empty());
    }
}
