//! Removal of orphaned execution containers.
//!
//! Containers outlive their execution only when a process crashed or a
//! removal failed. A sweep lists stopped containers carrying the managed
//! label and force-removes the ones nobody can still be using:
//!
//! - containers created by this instance, unless their execution is in flight;
//! - containers created by another instance once their expiry label has
//!   passed, or, without one, once they are older than `foreign_grace`.
//!
//! Several processes may share one Docker daemon, so another instance's
//! container that was just created or just exited is left alone.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::engine::ActiveExecutions;
use super::runtime::{unix_now, ContainerRuntime, ManagedContainer};
use crate::errors::SandboxError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.failed == 0
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Reap,
    InFlight,
    NotExpired,
}

#[derive(Clone)]
pub struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    active: ActiveExecutions,
    foreign_grace: Duration,
}

impl Reaper {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        active: ActiveExecutions,
        foreign_grace: Duration,
    ) -> Self {
        Self {
            runtime,
            active,
            foreign_grace,
        }
    }

    fn verdict(&self, container: &ManagedContainer, now: i64) -> Verdict {
        let ours = container.instance_id.as_deref() == Some(self.active.instance_id());
        if ours {
            let in_flight = container
                .execution_id
                .as_deref()
                .map(|id| self.active.contains(id))
                .unwrap_or(false);
            return if in_flight { Verdict::InFlight } else { Verdict::Reap };
        }

        let expires_at = container.expires_at.or_else(|| {
            let grace = self.foreign_grace.as_secs().min(i64::MAX as u64) as i64;
            container.created.map(|created| created.saturating_add(grace))
        });
        match expires_at {
            Some(deadline) if now >= deadline => Verdict::Reap,
            _ => Verdict::NotExpired,
        }
    }

    /// Remove every stopped managed container that is no longer in use.
    /// Per-container failures are logged and counted; only a failed listing
    /// aborts the sweep.
    pub async fn sweep(&self) -> Result<SweepReport, SandboxError> {
        let containers = self
            .runtime
            .list_stopped_managed()
            .await
            .map_err(|e| SandboxError::DockerError(format!("Failed to list containers: {}", e)))?;

        let now = unix_now();
        let mut report = SweepReport::default();
        for container in containers {
            match self.verdict(&container, now) {
                Verdict::Reap => {}
                Verdict::InFlight | Verdict::NotExpired => {
                    report.skipped += 1;
                    continue;
                }
            }

            match self.runtime.remove_container(&container.id).await {
                Ok(()) => {
                    log::info!(
                        "Reaped container {} ({})",
                        container.name.as_deref().unwrap_or("unnamed"),
                        container.status.as_deref().unwrap_or("unknown status")
                    );
                    report.removed += 1;
                }
                Err(e) => {
                    log::warn!("Failed to reap container {}: {}", container.id, e);
                    report.failed += 1;
                }
            }
        }

        if !report.is_noop() {
            log::info!(
                "Sweep finished: {} removed, {} failed, {} still in use",
                report.removed,
                report.failed,
                report.skipped
            );
        }
        Ok(report)
    }

    /// Sweep every `period` until `shutdown` turns true
    pub fn spawn_interval(&self, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reaper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reaper.sweep().await {
                            log::warn!("Periodic sweep failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::debug!("Periodic sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
