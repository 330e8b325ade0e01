//! Docker CLI backed container runtime.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::logs::{LogBuffer, LogFollower};
use super::runtime::{ContainerRuntime, ContainerSpec};
use crate::error::{Error, Result, SandboxStartError};

/// Drives containers through the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    cli: String,
    command_timeout: Duration,
}

impl DockerCli {
    /// Creates a runtime using `docker` from `PATH`.
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            cli: "docker".to_string(),
            command_timeout,
        }
    }

    /// Uses a different client binary (e.g. `podman`).
    pub fn with_cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = cli.into();
        self
    }

    /// Builds the `run` argument list for `spec`.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];

        for (key, value) in &spec.labels {
            args.extend(["--label".to_string(), format!("{}={}", key, value)]);
        }

        args.extend([
            "-p".to_string(),
            format!("{}:{}", spec.host_port, spec.container_port),
            "-v".to_string(),
            format!("{}:{}:rw", spec.mount_source.display(), spec.workdir),
            "-w".to_string(),
            spec.workdir.clone(),
            "--memory".to_string(),
            spec.memory_limit.clone(),
            "--cpus".to_string(),
            spec.cpu_limit.to_string(),
        ]);

        for (key, value) in &spec.env {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }

        args.push(spec.image.clone());
        args.extend(["sh".to_string(), "-c".to_string(), spec.command.clone()]);
        args
    }

    async fn exec(&self, args: &[&str]) -> std::io::Result<Output> {
        let output = Command::new(&self.cli)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.command_timeout, output).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!(
                    "{} {} timed out after {}s",
                    self.cli,
                    args.first().copied().unwrap_or_default(),
                    self.command_timeout.as_secs()
                ),
            )),
        }
    }
}

/// Maps a failed `docker run` to the matching start error.
fn classify_run_failure(spec: &ContainerSpec, stderr: &str) -> SandboxStartError {
    let lower = stderr.to_lowercase();
    let diagnostic = stderr.trim().to_string();

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        SandboxStartError::PortBindFailed {
            port: spec.host_port,
            diagnostic,
        }
    } else if lower.contains("unable to find image")
        || lower.contains("pull access denied")
        || lower.contains("manifest unknown")
    {
        SandboxStartError::ImagePullFailed {
            image: spec.image.clone(),
            diagnostic,
        }
    } else {
        SandboxStartError::ContainerStartFailed {
            container: spec.name.clone(),
            diagnostic,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ensure_image(&self, image: &str) -> std::result::Result<(), SandboxStartError> {
        if let Ok(output) = self.exec(&["image", "inspect", image]).await {
            if output.status.success() {
                tracing::debug!(image, "image present locally");
                return Ok(());
            }
        }

        tracing::info!(image, "pulling image");
        let output = self
            .exec(&["pull", image])
            .await
            .map_err(|e| SandboxStartError::ImagePullFailed {
                image: image.to_string(),
                diagnostic: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SandboxStartError::ImagePullFailed {
                image: image.to_string(),
                diagnostic: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn run_detached(
        &self,
        spec: &ContainerSpec,
    ) -> std::result::Result<String, SandboxStartError> {
        let args = Self::run_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        tracing::info!(
            container = %spec.name,
            image = %spec.image,
            host_port = spec.host_port,
            container_port = spec.container_port,
            "starting container"
        );

        let output =
            self.exec(&arg_refs)
                .await
                .map_err(|e| SandboxStartError::ContainerStartFailed {
                    container: spec.name.clone(),
                    diagnostic: e.to_string(),
                })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_run_failure(spec, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn follow_logs(&self, name: &str, buffer: LogBuffer) -> Result<LogFollower> {
        let mut child = Command::new(&self.cli)
            .args(["logs", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => return Err(Error::Io(std::io::Error::other("log streams were not piped"))),
        };

        let container = name.to_string();
        let task = tokio::spawn(async move {
            // Owned here so aborting the task kills the client.
            let _child = child;
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();
            let mut stdout_open = true;
            let mut stderr_open = true;

            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout_reader.next_line(), if stdout_open => match line {
                        Ok(Some(line)) => buffer.push(line),
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            tracing::debug!(container = %container, error = %e, "stdout log stream ended");
                            stdout_open = false;
                        }
                    },
                    line = stderr_reader.next_line(), if stderr_open => match line {
                        Ok(Some(line)) => buffer.push(line),
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            tracing::debug!(container = %container, error = %e, "stderr log stream ended");
                            stderr_open = false;
                        }
                    },
                }
            }
        });

        Ok(LogFollower::new(task))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let output = self
            .exec(&["rm", "-f", name])
            .await
            .map_err(|e| Error::Cleanup {
                target: name.to_string(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            tracing::info!(container = %name, "removed container");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            tracing::debug!(container = %name, "container already gone");
            return Ok(());
        }

        Err(Error::Cleanup {
            target: name.to_string(),
            reason: stderr.trim().to_string(),
        })
    }
}
