//! Container runtime abstraction.

use std::path::PathBuf;

use async_trait::async_trait;

use super::logs::{LogBuffer, LogFollower};
use crate::error::{Result, SandboxStartError};

/// Everything needed to launch one sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    pub image: String,
    /// Host port published for the service.
    pub host_port: u16,
    /// Port the service listens on inside the container.
    pub container_port: u16,
    /// Host path of the code tree, mounted read-write.
    pub mount_source: PathBuf,
    /// Mount point and working directory inside the container.
    pub workdir: String,
    /// Shell command run as the container entrypoint.
    pub command: String,
    pub env: Vec<(String, String)>,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub labels: Vec<(String, String)>,
}

impl ContainerSpec {
    /// Looks up an environment value by key.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Operations the sandbox manager needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes sure `image` is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> std::result::Result<(), SandboxStartError>;

    /// Creates and starts a detached container, returning its id.
    async fn run_detached(&self, spec: &ContainerSpec)
        -> std::result::Result<String, SandboxStartError>;

    /// Starts streaming the container's console into `buffer`.
    async fn follow_logs(&self, name: &str, buffer: LogBuffer) -> Result<LogFollower>;

    /// Forcibly removes the container. Removing a missing container succeeds.
    async fn remove(&self, name: &str) -> Result<()>;
}
