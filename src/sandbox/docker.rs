//! Container-backed sandbox implementation using Bollard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;

use crate::config::memory_limit_bytes;
use crate::error::{Error, Result};

use super::process;
use super::provider::{sandbox_name, ExecResult, Sandbox, SandboxConfig, SandboxProvider};

/// Timeout for container lifecycle calls (create + start, remove).
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Label put on every container this crate starts.
const MANAGED_LABEL: &str = "agent-sandbox.managed";

/// A sandbox running as a docker container.
pub struct DockerSandboxInstance {
    /// Container name.
    name: String,
    docker: Docker,
    /// The configuration used to create this sandbox.
    config: SandboxConfig,
    /// Whether the container has been removed.
    destroyed: AtomicBool,
}

impl DockerSandboxInstance {
    async fn collect_output(
        &self,
        exec_id: &str,
    ) -> std::result::Result<ExecResult, bollard::errors::Error> {
        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(exec_id, None).await?
        {
            while let Some(msg) = output.next().await {
                match msg? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(ExecResult {
            output: process::join_output(&stdout, &stderr),
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandboxInstance {
    fn id(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &SandboxConfig {
        &self.config
    }

    async fn run(&self, command: &str) -> Result<ExecResult> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Execution(format!(
                "sandbox {} has been destroyed",
                self.name
            )));
        }

        tracing::debug!(container = %self.name, command = %command, "docker exec");

        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec!["sh", "-c", command]),
            working_dir: Some(self.config.work_dir.as_str()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&self.name, options)
            .await
            .map_err(|e| Error::Execution(format!("failed to create exec: {}", e)))?;

        match tokio::time::timeout(self.config.timeout, self.collect_output(&exec.id)).await {
            Ok(result) => result.map_err(|e| Error::Execution(e.to_string())),
            Err(_) => Err(Error::Timeout(self.config.timeout)),
        }
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = force_remove(&self.docker, &self.name).await {
            self.destroyed.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tracing::info!(container = %self.name, "removed sandbox container");
        Ok(())
    }
}

/// Provider that boots one container per sandbox.
#[derive(Clone)]
pub struct DockerSandbox {
    docker: Docker,
    /// Counter for generating unique container names (shared across clones).
    counter: Arc<AtomicU64>,
}

impl DockerSandbox {
    /// Connects to the local docker daemon using the environment defaults.
    ///
    /// The connection is lazy; an unreachable daemon surfaces on the first
    /// [`SandboxProvider::create`].
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Provisioning(format!("failed to connect to docker: {}", e)))?;
        Ok(Self::with_client(docker))
    }

    /// Connects through the unix socket at `path`.
    #[cfg(unix)]
    pub fn with_socket(path: &str) -> Result<Self> {
        let docker = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| Error::Provisioning(format!("failed to connect to docker: {}", e)))?;
        Ok(Self::with_client(docker))
    }

    /// Uses an already configured client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn start(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> std::result::Result<(), bollard::errors::Error> {
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        self.docker.create_container(Some(options), body).await?;
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
    }
}

#[async_trait]
impl SandboxProvider for DockerSandbox {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, config: SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        let name = sandbox_name(&self.counter);
        let body = container_body(&config)?;

        let started = tokio::time::timeout(LIFECYCLE_TIMEOUT, self.start(&name, body)).await;
        let failure = match started {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {:?}", LIFECYCLE_TIMEOUT)),
        };

        if let Some(reason) = failure {
            // The daemon may have created the container before failing
            if let Err(e) = force_remove(&self.docker, &name).await {
                tracing::warn!(container = %name, error = %e, "failed to remove half-started container");
            }
            return Err(Error::Provisioning(format!(
                "failed to start container {}: {}",
                name, reason
            )));
        }

        tracing::info!(container = %name, image = %config.image, "started sandbox container");

        Ok(Arc::new(DockerSandboxInstance {
            name,
            docker: self.docker.clone(),
            config,
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// Builds the container definition: limits, isolation, and an idle command
/// that keeps the container alive for `exec`.
fn container_body(config: &SandboxConfig) -> Result<ContainerCreateBody> {
    let memory = memory_limit_bytes(&config.memory_limit).ok_or_else(|| {
        Error::Provisioning(format!("invalid memory limit '{}'", config.memory_limit))
    })?;

    let host_config = HostConfig {
        memory: Some(memory),
        nano_cpus: Some((config.cpu_limit * 1e9) as i64),
        network_mode: Some(if config.network_enabled { "bridge" } else { "none" }.to_string()),
        ..Default::default()
    };

    let mut env: Vec<String> = config
        .environment
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    env.sort();

    Ok(ContainerCreateBody {
        image: Some(config.image.clone()),
        working_dir: Some(config.work_dir.clone()),
        env: Some(env),
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        host_config: Some(host_config),
        labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
        ..Default::default()
    })
}

/// Force-removes container `name`. A container that is already gone counts
/// as removed.
async fn force_remove(docker: &Docker, name: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    let reason = match tokio::time::timeout(
        LIFECYCLE_TIMEOUT,
        docker.remove_container(name, Some(options)),
    )
    .await
    {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) if is_missing(&e) => {
            tracing::debug!(container = %name, "container already removed");
            return Ok(());
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", LIFECYCLE_TIMEOUT),
    };

    Err(Error::Destroy {
        id: name.to_string(),
        reason,
    })
}

fn is_missing(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
