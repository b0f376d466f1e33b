// src/test_utils/mock_runtime.rs
//
// In-memory ContainerRuntime. A "container" interprets the source file found
// in its first mount, one instruction per line:
//   print <text>   append <text> and a newline to the output
//   sleep <ms>     wait that many milliseconds
//   exit <code>    stop with that exit code
// Anything else is ignored. Reaching the end of the file exits with 0.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::EngineError;
use crate::executors::runtime::{
    append_bounded, unix_now, ContainerRuntime, ContainerSpec, ManagedContainer,
    EXECUTION_LABEL, INSTANCE_LABEL, MANAGED_LABEL,
};

#[derive(Debug, Clone, PartialEq)]
enum MockState {
    Created,
    Running,
    Exited(i64),
}

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    state: MockState,
    output: String,
    created: i64,
}

#[derive(Default)]
struct MockInner {
    available: bool,
    local_images: HashSet<String>,
    failing_pulls: HashSet<String>,
    failing_removes: HashSet<String>,
    pulls: HashMap<String, usize>,
    containers: HashMap<String, MockContainer>,
    created: Vec<String>,
    removals: HashMap<String, usize>,
    specs: Vec<ContainerSpec>,
    running: usize,
    peak_running: usize,
    stops: usize,
    calls: usize,
    fail_start: bool,
    next_id: usize,
}

#[derive(Clone)]
pub struct MockRuntime {
    inner: Arc<Mutex<MockInner>>,
    pull_delay: Duration,
    start_delay: Duration,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        let inner = MockInner {
            available: true,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            pull_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
        }
    }

    pub fn unavailable(self) -> Self {
        self.inner.lock().unwrap().available = false;
        self
    }

    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_local_image(self, image: &str) -> Self {
        self.inner.lock().unwrap().local_images.insert(image.to_string());
        self
    }

    pub fn failing_pull(self, image: &str) -> Self {
        self.inner.lock().unwrap().failing_pulls.insert(image.to_string());
        self
    }

    pub fn failing_start(self) -> Self {
        self.inner.lock().unwrap().fail_start = true;
        self
    }

    pub fn failing_remove(self, id: &str) -> Self {
        self.inner.lock().unwrap().failing_removes.insert(id.to_string());
        self
    }

    /// Register a stopped, managed container left behind long ago by an
    /// unknown instance
    pub fn with_orphan(self, id: &str, execution_id: &str) -> Self {
        self.insert_stopped(id, execution_id, None, 0)
    }

    /// Register a stopped, managed container created by `instance_id` at
    /// unix time `created`
    pub fn with_instance_container(
        self,
        id: &str,
        execution_id: &str,
        instance_id: &str,
        created: i64,
    ) -> Self {
        self.insert_stopped(id, execution_id, Some(instance_id), created)
    }

    fn insert_stopped(
        self,
        id: &str,
        execution_id: &str,
        instance_id: Option<&str>,
        created: i64,
    ) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            let mut labels = HashMap::new();
            labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
            labels.insert(EXECUTION_LABEL.to_string(), execution_id.to_string());
            if let Some(instance_id) = instance_id {
                labels.insert(INSTANCE_LABEL.to_string(), instance_id.to_string());
            }
            let spec = ContainerSpec {
                name: format!("orphan-{}", id),
                image: "python:3.11-slim".to_string(),
                command: Vec::new(),
                working_dir: "/workspace".to_string(),
                mounts: Vec::new(),
                memory_bytes: 0,
                cpu_period: 0,
                cpu_quota: 0,
                network_enabled: false,
                labels,
            };
            inner.containers.insert(
                id.to_string(),
                MockContainer {
                    spec,
                    state: MockState::Exited(0),
                    output: String::new(),
                    created,
                },
            );
        }
        self
    }

    pub fn remove_local_image(&self, image: &str) {
        self.inner.lock().unwrap().local_images.remove(image);
    }

    pub fn pull_count(&self, image: &str) -> usize {
        self.inner.lock().unwrap().pulls.get(image).copied().unwrap_or(0)
    }

    pub fn created_count(&self) -> usize {
        self.inner.lock().unwrap().created.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().unwrap().running
    }

    pub fn peak_running(&self) -> usize {
        self.inner.lock().unwrap().peak_running
    }

    pub fn stop_count(&self) -> usize {
        self.inner.lock().unwrap().stops
    }

    /// Number of runtime calls made, including pings
    pub fn call_count(&self) -> usize {
        self.inner.lock().unwrap().calls
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.inner.lock().unwrap().specs.last().cloned()
    }

    /// Every created container was removed exactly once
    pub fn all_removed_once(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .created
            .iter()
            .all(|id| inner.removals.get(id).copied() == Some(1))
    }

    fn record_call(&self) -> std::sync::MutexGuard<'_, MockInner> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls += 1;
        inner
    }

    fn source_file(spec: &ContainerSpec) -> Option<PathBuf> {
        let (host, _) = spec.mounts.first()?;
        let file = spec.command.last()?;
        let direct = host.join(file);
        if direct.exists() {
            return Some(direct);
        }
        // Shell-wrapped commands: look for the main.* file instead
        std::fs::read_dir(host)
            .ok()?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .find(|path| is_main_file(path))
    }

    fn mark_stopped(inner: &mut MockInner, id: &str, exit_code: i64) {
        if let Some(container) = inner.containers.get_mut(id) {
            if container.state == MockState::Running {
                inner.running -= 1;
            }
            if !matches!(container.state, MockState::Exited(_)) {
                container.state = MockState::Exited(exit_code);
            }
        }
    }
}

fn is_main_file(path: &Path) -> bool {
    path.file_stem().map(|stem| stem == "main").unwrap_or(false)
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), EngineError> {
        let inner = self.record_call();
        if inner.available {
            Ok(())
        } else {
            Err(EngineError::Runtime("daemon unreachable".to_string()))
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        Ok(self.record_call().local_images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        {
            let mut inner = self.record_call();
            *inner.pulls.entry(image.to_string()).or_insert(0) += 1;
        }
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.failing_pulls.contains(image) {
            return Err(EngineError::ImagePull {
                image: image.to_string(),
                message: "manifest unknown".to_string(),
            });
        }
        inner.local_images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut inner = self.record_call();
        if !inner.local_images.contains(&spec.image) {
            return Err(EngineError::Runtime(format!("No such image: {}", spec.image)));
        }

        inner.next_id += 1;
        let id = format!("mock-{}", inner.next_id);
        inner.created.push(id.clone());
        inner.specs.push(spec.clone());
        inner.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                state: MockState::Created,
                output: String::new(),
                created: unix_now(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let mut inner = self.record_call();
        if inner.fail_start {
            return Err(EngineError::Runtime("OCI runtime create failed".to_string()));
        }

        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::Runtime(format!("No such container: {}", id)))?;
        container.state = MockState::Running;
        inner.running += 1;
        inner.peak_running = inner.peak_running.max(inner.running);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let spec = {
            let inner = self.record_call();
            let container = inner
                .containers
                .get(id)
                .ok_or_else(|| EngineError::Runtime(format!("No such container: {}", id)))?;
            if let MockState::Exited(code) = container.state {
                return Ok(code);
            }
            container.spec.clone()
        };

        let script = match Self::source_file(&spec) {
            Some(path) => tokio::fs::read_to_string(path).await?,
            None => String::new(),
        };

        let mut exit_code = 0;
        for line in script.lines() {
            let (instruction, argument) = line.split_once(' ').unwrap_or((line, ""));
            match instruction {
                "print" => {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(container) = inner.containers.get_mut(id) {
                        container.output.push_str(argument);
                        container.output.push('\n');
                    }
                }
                "sleep" => {
                    let millis = argument.trim().parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                "exit" => {
                    exit_code = argument.trim().parse().unwrap_or(1);
                    break;
                }
                _ => {}
            }
        }

        let mut inner = self.inner.lock().unwrap();
        Self::mark_stopped(&mut inner, id, exit_code);
        match inner.containers.get(id).map(|c| c.state.clone()) {
            Some(MockState::Exited(code)) => Ok(code),
            _ => Ok(exit_code),
        }
    }

    async fn container_logs(&self, id: &str, limit: usize) -> Result<String, EngineError> {
        let inner = self.record_call();
        let container = inner
            .containers
            .get(id)
            .ok_or_else(|| EngineError::Runtime(format!("No such container: {}", id)))?;
        let mut output = String::new();
        append_bounded(&mut output, &container.output, limit);
        Ok(output)
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        let mut inner = self.record_call();
        inner.stops += 1;
        Self::mark_stopped(&mut inner, id, 137);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut inner = self.record_call();
        *inner.removals.entry(id.to_string()).or_insert(0) += 1;
        if inner.failing_removes.contains(id) {
            return Err(EngineError::Runtime(format!("removal of {} is already in progress", id)));
        }
        if let Some(container) = inner.containers.remove(id) {
            if container.state == MockState::Running {
                inner.running -= 1;
            }
        }
        Ok(())
    }

    async fn list_stopped_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        let inner = self.record_call();
        let mut stopped: Vec<ManagedContainer> = inner
            .containers
            .iter()
            .filter(|(_, c)| c.state != MockState::Running)
            .filter(|(_, c)| c.spec.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true"))
            .map(|(id, c)| {
                ManagedContainer::from_labels(
                    id.clone(),
                    Some(c.spec.name.clone()),
                    &c.spec.labels,
                    Some(c.created),
                    Some(format!("{:?}", c.state)),
                )
            })
            .collect();
        stopped.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stopped)
    }
}
