// src/executors/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    ListContainersOptions as BollardListContainersOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::default::Default;
use std::time::Duration;

use super::runtime::{
    append_bounded, ContainerRuntime, ContainerSpec, ManagedContainer, MANAGED_LABEL,
};
use crate::errors::EngineError;

const NOT_FOUND: u16 = 404;
const NOT_MODIFIED: u16 = 304;

/// `ContainerRuntime` backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the platform's default socket
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Split `repo[:tag]` so that pulls never fall back to "all tags".
/// Digest references are passed through untouched.
pub(crate) fn split_image_reference(image: &str) -> (String, Option<String>) {
    if image.contains('@') {
        return (image.to_string(), None);
    }

    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(colon) => {
            let split = last_slash + colon;
            (image[..split].to_string(), Some(image[split + 1..].to_string()))
        }
        None => (image.to_string(), Some("latest".to_string())),
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, NOT_FOUND) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let (from_image, tag) = split_image_reference(image);
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(from_image),
            tag,
            ..Default::default()
        });

        let mut pull_stream = self.docker.create_image(pull_options, None, None);
        while let Some(progress) = pull_stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::trace!("Pull {}: {}", image, status);
                    }
                }
                Err(e) => {
                    return Err(EngineError::ImagePull {
                        image: image.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let binds = spec
            .mounts
            .iter()
            .map(|(host, container)| format!("{}:{}:rw", host.display(), container))
            .collect();

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(!spec.network_enabled),
            host_config: Some(HostConfig {
                binds: Some(binds),
                memory: Some(spec.memory_bytes),
                cpu_period: Some(spec.cpu_period),
                cpu_quota: Some(spec.cpu_quota),
                network_mode: (!spec.network_enabled).then(|| "none".to_string()),
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        for warning in &container.warnings {
            log::warn!("Docker warning for {}: {}", spec.name, warning);
        }
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        // wait_container returns a stream. We need to await the next item for the result.
        let mut wait_stream = self
            .docker
            .wait_container(id, None::<BollardWaitContainerOptionsQuery>);

        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Runtime(
                "Container wait stream ended unexpectedly".to_string(),
            )),
        }
    }

    async fn container_logs(&self, id: &str, limit: usize) -> Result<String, EngineError> {
        let mut output_stream = self.docker.logs(
            id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(log_result) = output_stream.next().await {
            let message = match log_result? {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => message,
                LogOutput::Console { message } => message,
                _ => continue,
            };
            if !append_bounded(&mut output, &String::from_utf8_lossy(&message), limit) {
                break;
            }
        }

        Ok(output)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let options = BollardStopContainerOptionsQuery {
            t: Some(grace.as_secs().min(i32::MAX as u64) as i32),
            ..Default::default()
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped
            Err(e) if is_status(&e, NOT_MODIFIED) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, NOT_FOUND) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_stopped_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);
        filters.insert(
            "status".to_string(),
            vec!["created".to_string(), "exited".to_string(), "dead".to_string()],
        );

        let options = BollardListContainersOptionsQuery {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let summaries = self.docker.list_containers(Some(options)).await?;
        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string());
                let labels = summary.labels.unwrap_or_default();
                Some(ManagedContainer::from_labels(
                    id,
                    name,
                    &labels,
                    summary.created,
                    summary.status,
                ))
            })
            .collect())
    }
}
