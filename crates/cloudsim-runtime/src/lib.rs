//! Container Runtime Client: a thin adapter over the Docker engine API.
//!
//! All upper layers treat this as the sole source of runtime truth. The
//! adapter never retries; it classifies every engine failure into the
//! `RuntimeError` taxonomy and lets the lifecycle manager decide what to do.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, instrument};

use cloudsim_common::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecStream, RuntimeError, RuntimeResult,
};

pub mod fake;

pub use fake::FakeEngine;

/// Keep-alive command for instance containers; the simulated machine idles
/// until the learner execs into it.
const KEEP_ALIVE_CMD: [&str; 3] = ["/bin/sh", "-c", "while true; do sleep 30; done"];

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connect using the platform-default engine socket.
    pub fn from_local_defaults() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(map_engine_err)?;
        Ok(Self::new(Arc::new(docker)))
    }
}

/// Classify a bollard error into the runtime taxonomy. A 404 means the
/// referenced container vanished; transport-level failures mean the engine
/// itself is unreachable.
fn map_engine_err(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::RefNotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::OperationFailed(format!("engine returned {status_code}: {message}")),
        BollardError::RequestTimeoutError => {
            RuntimeError::Unavailable("engine request timed out".to_string())
        }
        BollardError::IOError { err } => RuntimeError::Unavailable(err.to_string()),
        other => {
            let text = other.to_string();
            if text.contains("connect") || text.contains("socket") {
                RuntimeError::Unavailable(text)
            } else {
                RuntimeError::OperationFailed(text)
            }
        }
    }
}

fn map_status(status: ContainerStateStatusEnum) -> ContainerStatus {
    match status {
        ContainerStateStatusEnum::CREATED => ContainerStatus::Created,
        ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
        ContainerStateStatusEnum::PAUSED => ContainerStatus::Paused,
        ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
        ContainerStateStatusEnum::REMOVING => ContainerStatus::Removing,
        ContainerStateStatusEnum::EXITED => ContainerStatus::Exited,
        ContainerStateStatusEnum::DEAD | ContainerStateStatusEnum::EMPTY => ContainerStatus::Dead,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut labels: HashMap<String, String> = HashMap::new();
        for (k, v) in &spec.labels {
            labels.insert(k.clone(), v.clone());
        }

        let host_config = HostConfig {
            memory: spec
                .resources
                .memory_mb
                .map(|mb| i64::from(mb) * 1024 * 1024),
            nano_cpus: spec
                .resources
                .cpu_cores
                .map(|c| i64::from(c) * 1_000_000_000),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(KEEP_ALIVE_CMD.iter().map(|s| s.to_string()).collect()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: Some(labels),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| match map_engine_err(e) {
                // On create, a 404 is an unknown image, not a vanished
                // container: the engine rejected the call.
                RuntimeError::RefNotFound(msg) => {
                    RuntimeError::OperationFailed(format!("no such image: {msg}"))
                }
                other => other,
            })?;

        info!(container_id = %created.id, "container created");
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn start(&self, runtime_ref: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(runtime_ref, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_engine_err)
    }

    #[instrument(skip(self))]
    async fn stop(&self, runtime_ref: &str, timeout_secs: i64) -> RuntimeResult<()> {
        self.docker
            .stop_container(runtime_ref, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(map_engine_err)
    }

    #[instrument(skip(self))]
    async fn restart(&self, runtime_ref: &str, timeout_secs: i64) -> RuntimeResult<()> {
        self.docker
            .restart_container(
                runtime_ref,
                Some(RestartContainerOptions {
                    t: timeout_secs as isize,
                }),
            )
            .await
            .map_err(map_engine_err)
    }

    #[instrument(skip(self))]
    async fn remove(&self, runtime_ref: &str, force: bool) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                runtime_ref,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_engine_err)
    }

    #[instrument(skip(self))]
    async fn inspect(&self, runtime_ref: &str) -> RuntimeResult<ContainerStatus> {
        let response = self
            .docker
            .inspect_container(runtime_ref, None::<InspectContainerOptions>)
            .await
            .map_err(map_engine_err)?;

        let status = response
            .state
            .and_then(|s| s.status)
            .ok_or_else(|| {
                RuntimeError::OperationFailed("inspect response carried no state".to_string())
            })?;
        Ok(map_status(status))
    }

    #[instrument(skip(self, command))]
    async fn exec(&self, runtime_ref: &str, command: Vec<String>) -> RuntimeResult<ExecStream> {
        let created = self
            .docker
            .create_exec(
                runtime_ref,
                CreateExecOptions::<String> {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    cmd: Some(command),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_engine_err)?;

        let started = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(map_engine_err)?;

        match started {
            StartExecResults::Attached { output, input } => {
                debug!(exec_id = %created.id, "exec stream attached");
                let output = output
                    .map(|entry| match entry {
                        Ok(LogOutput::StdOut { message })
                        | Ok(LogOutput::StdErr { message })
                        | Ok(LogOutput::Console { message }) => Ok(message.to_vec()),
                        Ok(LogOutput::StdIn { .. }) => Ok(Vec::new()),
                        Err(e) => Err(std::io::Error::other(e.to_string())),
                    })
                    .boxed();
                Ok(ExecStream { input, output })
            }
            StartExecResults::Detached => Err(RuntimeError::OperationFailed(
                "engine returned a detached exec stream".to_string(),
            )),
        }
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.docker.ping().await.map_err(map_engine_err)?;
        Ok(())
    }
}
