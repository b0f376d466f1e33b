//! Seam between the execution logic and the isolation runtime.
//!
//! `DockerRuntime` is the production implementation. Keeping the engine,
//! the image cache and the reaper behind this trait lets them be driven by
//! an in-memory runtime in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::EngineError;

/// Label carried by every container this service creates
pub const MANAGED_LABEL: &str = "crucible.managed";
/// Label holding the execution id that owns a container
pub const EXECUTION_LABEL: &str = "crucible.execution";
/// Label holding the id of the service instance that created a container
pub const INSTANCE_LABEL: &str = "crucible.instance";
/// Label holding the unix time after which the owning execution is over
pub const EXPIRES_LABEL: &str = "crucible.expires";

/// Everything needed to create one execution container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    /// (host path, container path) pairs, mounted read-write.
    pub mounts: Vec<(PathBuf, String)>,
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub network_enabled: bool,
    pub labels: HashMap<String, String>,
}

/// A container carrying the managed label, as seen by a listing
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: Option<String>,
    pub execution_id: Option<String>,
    pub instance_id: Option<String>,
    /// Unix seconds from the `EXPIRES_LABEL` label
    pub expires_at: Option<i64>,
    /// Creation time in unix seconds
    pub created: Option<i64>,
    pub status: Option<String>,
}

impl ManagedContainer {
    pub(crate) fn from_labels(
        id: String,
        name: Option<String>,
        labels: &HashMap<String, String>,
        created: Option<i64>,
        status: Option<String>,
    ) -> Self {
        Self {
            id,
            name,
            execution_id: labels.get(EXECUTION_LABEL).cloned(),
            instance_id: labels.get(INSTANCE_LABEL).cloned(),
            expires_at: labels.get(EXPIRES_LABEL).and_then(|v| v.parse().ok()),
            created,
            status,
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime daemon answers
    async fn ping(&self) -> Result<(), EngineError>;

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create a container without starting it; returns its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Block until the container stops; returns its exit code
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// Merged stdout/stderr, truncated to `limit` bytes
    async fn container_logs(&self, id: &str, limit: usize) -> Result<String, EngineError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    /// Force-remove a container. Removing a missing container is not an error.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Managed containers in a terminal-but-not-removed state
    async fn list_stopped_managed(&self) -> Result<Vec<ManagedContainer>, EngineError>;
}

pub(crate) const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Append `chunk` to `buffer` without letting it grow past `limit` bytes.
/// Returns false once the limit has been hit.
pub(crate) fn append_bounded(buffer: &mut String, chunk: &str, limit: usize) -> bool {
    let remaining = limit.saturating_sub(buffer.len());
    if chunk.len() <= remaining {
        buffer.push_str(chunk);
        return true;
    }

    let mut cut = remaining;
    while cut > 0 && !chunk.is_char_boundary(cut) {
        cut -= 1;
    }
    buffer.push_str(&chunk[..cut]);
    buffer.push_str(TRUNCATION_MARKER);
    false
}
