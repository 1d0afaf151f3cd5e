//! The Docker-backed container runner.

use crate::{parse_stdout, sanitize_floats, ContainerRunner, ExecError, RunConfig};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    /// Connect with the daemon's local defaults (unix socket, or the
    /// environment's `DOCKER_HOST`).
    pub fn connect() -> Result<Self, ExecError> {
        let docker = Docker::connect_with_local_defaults().map_err(ExecError::Connect)?;
        Ok(Self { docker })
    }

    /// Ping the daemon. Failing here at startup is fatal for the worker.
    pub async fn check_accessible(&self) -> Result<(), ExecError> {
        self.docker.ping().await.map_err(ExecError::Connect)?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), ExecError> {
        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };
        let pulled = self
            .docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await;
        if let Err(err) = pulled {
            // A locally present image still serves when the registry is
            // unreachable.
            tracing::warn!(image, error = %err, "image pull failed, checking for a local copy");
            self.docker
                .inspect_image(image)
                .await
                .map_err(|source| ExecError::Pull {
                    image: image.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn run(&self, config: &RunConfig, stdin: &[String]) -> Result<Value, ExecError> {
        self.pull_image(&config.image).await?;

        let container = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                Config::<String> {
                    image: Some(config.image.clone()),
                    cmd: if config.command.is_empty() {
                        None
                    } else {
                        Some(config.command.clone())
                    },
                    env: Some(
                        config
                            .environments
                            .iter()
                            .map(|(key, value)| format!("{key}={value}"))
                            .collect(),
                    ),
                    attach_stdin: Some(true),
                    open_stdin: Some(true),
                    stdin_once: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(ExecError::Create)?;
        let id = container.id;
        tracing::debug!(container = %id, image = %config.image, "created container");

        // Attach before starting so no early read of stdin can be missed.
        let AttachContainerResults {
            output: _output,
            mut input,
        } = self
            .docker
            .attach_container(
                &id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(ExecError::Attach)?;

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(ExecError::Start)?;

        for chunk in stdin {
            input
                .write_all(chunk.as_bytes())
                .await
                .map_err(ExecError::Stdin)?;
        }
        input.flush().await.map_err(ExecError::Stdin)?;
        drop(input);

        let wait = self
            .docker
            .wait_container(&id, None::<WaitContainerOptions<String>>)
            .try_collect::<Vec<_>>();
        match tokio::time::timeout(config.timeout, wait).await {
            Err(_) => return Err(ExecError::Timeout(config.timeout.as_secs())),
            Ok(Err(bollard::errors::Error::DockerContainerWaitError { error, code })) => {
                return Err(ExecError::Exit(code, error))
            }
            Ok(Err(err)) => return Err(ExecError::Wait(err)),
            Ok(Ok(_)) => {}
        }

        let mut stdout = String::new();
        let mut logs = self.docker.logs(
            &id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: false,
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            let chunk = chunk.map_err(ExecError::Logs)?;
            stdout.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        tracing::debug!(container = %id, stdout_bytes = stdout.len(), "collected container stdout");

        if config.remove {
            self.docker
                .remove_container(&id, None::<RemoveContainerOptions>)
                .await
                .map_err(ExecError::Remove)?;
        }

        let value = parse_stdout(&stdout).ok_or(ExecError::Parse)?;
        let value = sanitize_floats(value);

        if let Some(error) = value.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ExecError::Runtime(message));
        }
        Ok(value)
    }
}
