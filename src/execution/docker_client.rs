//! Docker API wrapper using the bollard crate.
//!
//! Covers the one-shot container lifecycle used by the render sandbox:
//! create, start, wait, collect logs, remove.

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;

use crate::error::StrategyError;
use crate::execution::resources::ExecutionLimits;

/// Configuration for creating a render container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique container name.
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    pub limits: ExecutionLimits,
    /// Bind mounts in `host:container` form.
    pub volumes: Vec<String>,
    /// User to run as (e.g., "1000:1000").
    pub user: Option<String>,
    /// Network mode; `none` for render runs.
    pub network_mode: String,
}

/// Output streams collected from a finished container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

impl ContainerConfig {
    /// A network-isolated container with default render limits.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: Vec::new(),
            working_dir: None,
            limits: ExecutionLimits::default(),
            volumes: Vec::new(),
            user: None,
            network_mode: "none".to_string(),
        }
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<String>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }

    fn host_config(&self) -> HostConfig {
        HostConfig {
            memory: Some(self.limits.memory_bytes()),
            cpu_period: Some(self.limits.cpu_period()),
            cpu_quota: Some(self.limits.cpu_quota()),
            pids_limit: Some(self.limits.pids_limit()),
            network_mode: Some(self.network_mode.clone()),
            binds: if self.volumes.is_empty() {
                None
            } else {
                Some(self.volumes.clone())
            },
            ..Default::default()
        }
    }
}

/// Docker client wrapper for render containers.
pub struct DockerClient {
    docker: Docker,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient").finish_non_exhaustive()
    }
}

impl DockerClient {
    /// Connect to the local Docker daemon.
    ///
    /// Connecting does not contact the daemon; use [`DockerClient::ping`]
    /// to check availability.
    pub fn new() -> Result<Self, StrategyError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| StrategyError::Unavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), StrategyError> {
        self.docker
            .ping()
            .await
            .map_err(|e| StrategyError::Unavailable(format!("Docker daemon not reachable: {e}")))?;
        Ok(())
    }

    /// Create a container and return its ID.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, StrategyError> {
        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(config.cmd.clone()),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            host_config: Some(config.host_config()),
            network_disabled: Some(config.network_mode == "none"),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| StrategyError::Docker(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), StrategyError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| StrategyError::Docker(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Wait for a container to stop and return its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, StrategyError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(StrategyError::Docker(format!(
                "Error waiting for container: {e}"
            ))),
            None => Err(StrategyError::Docker(
                "Container wait stream ended without a status".to_string(),
            )),
        }
    }

    /// Stdout and stderr of a container, kept apart.
    pub async fn get_logs(&self, id: &str) -> Result<ContainerLogs, StrategyError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = ContainerLogs::default();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    output.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(StrategyError::Docker(format!("Error reading logs: {e}")));
                }
            }
        }

        Ok(output)
    }

    /// Remove a container, killing it first when `force` is set.
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), StrategyError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| StrategyError::Docker(format!("Failed to remove container: {e}")))?;

        Ok(())
    }

    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Pull an image, draining the progress stream.
    pub async fn pull_image(&self, image: &str) -> Result<(), StrategyError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| StrategyError::Docker(format!("Failed to pull image: {e}")))?;
        }

        Ok(())
    }
}
