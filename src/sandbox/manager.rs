//! Sandbox lifecycle management.
//!
//! [`SandboxManager::start`] brings a container up and hands back a
//! [`SessionGuard`]. The guard is the only way to reach a running session,
//! so every path out of a verification run passes through its release.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;

use super::guard::SessionGuard;
use super::image::select_image;
use super::runtime::{ContainerRuntime, ContainerSpec};
use super::session::{SandboxSession, SessionState};
use crate::collaborators::StartupPlan;
use crate::config::{SandboxConfig, UploadConfig};
use crate::error::SandboxStartError;
use crate::ports::PortAllocator;

/// Label attached to every sandbox container.
pub const SESSION_LABEL: &str = "code-analyzer.session";

/// Starts and stops sandbox containers.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    limiter: Arc<Semaphore>,
    config: SandboxConfig,
    upload: UploadConfig,
}

impl SandboxManager {
    /// Creates a manager whose port range and session ceiling come from `config`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);
        Self::with_ports(runtime, config, Arc::new(ports))
    }

    /// Creates a manager around an existing allocator.
    pub fn with_ports(
        runtime: Arc<dyn ContainerRuntime>,
        config: SandboxConfig,
        ports: Arc<PortAllocator>,
    ) -> Self {
        Self {
            runtime,
            ports,
            limiter: Arc::new(Semaphore::new(config.max_sessions.max(1))),
            config,
            upload: UploadConfig::default(),
        }
    }

    /// Sets the upload layout used to translate mount paths to host paths.
    pub fn with_upload(mut self, upload: UploadConfig) -> Self {
        self.upload = upload;
        self
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Number of sessions that could start right now without queueing.
    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Starts a sandbox for the project at `code_root` running `plan`.
    ///
    /// Waits for a free slot when the session ceiling is reached. Any failure
    /// after the session reached `Starting` tears it down before returning.
    pub async fn start(
        &self,
        plan: &StartupPlan,
        code_root: &Path,
    ) -> Result<SessionGuard, SandboxStartError> {
        let permit = self.limiter.clone().acquire_owned().await.map_err(|_| {
            SandboxStartError::ContainerStartFailed {
                container: "-".to_string(),
                diagnostic: "sandbox limiter closed".to_string(),
            }
        })?;

        let host_port = self.ports.allocate()?;
        let container_port = plan.service_port.unwrap_or(host_port);
        let image = select_image(code_root);
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();

        if let Some(hint) = plan.base_image_hint.as_deref() {
            if hint != image {
                tracing::info!(session_id = %id, hint, selected = image, "ignoring planner image hint");
            }
        }

        let mount_source = self.upload.host_path(code_root);
        let mut session = SandboxSession::new(
            id,
            image.to_string(),
            host_port,
            container_port,
            &self.config.probe_host,
            code_root.to_path_buf(),
            mount_source.clone(),
            self.config.log_capacity,
        );
        session.transition(SessionState::Starting);

        let mut env: Vec<(String, String)> = vec![("PORT".to_string(), container_port.to_string())];
        env.extend(
            plan.env
                .iter()
                .filter(|(k, _)| k.as_str() != "PORT")
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let spec = ContainerSpec {
            name: session.container_name().to_string(),
            image: image.to_string(),
            host_port,
            container_port,
            mount_source,
            workdir: self.config.container_workdir.clone(),
            command: plan.entry_command(),
            env,
            memory_limit: self.config.memory_limit.clone(),
            cpu_limit: self.config.cpu_limit,
            labels: vec![(SESSION_LABEL.to_string(), session.id().to_string())],
        };

        tracing::info!(
            session_id = %session.id(),
            image,
            port = host_port,
            container_port,
            "starting sandbox"
        );

        if let Err(e) = self.launch(&mut session, &spec).await {
            tracing::error!(session_id = %session.id(), error = %e, "sandbox failed to start");
            session.transition(SessionState::Failed);
            teardown(self.runtime.as_ref(), &self.ports, &mut session).await;
            return Err(e);
        }

        Ok(SessionGuard::new(
            session,
            self.runtime.clone(),
            self.ports.clone(),
            permit,
        ))
    }

    async fn launch(
        &self,
        session: &mut SandboxSession,
        spec: &ContainerSpec,
    ) -> Result<(), SandboxStartError> {
        self.runtime.ensure_image(&spec.image).await?;
        let container_id = self.runtime.run_detached(spec).await?;
        tracing::debug!(session_id = %session.id(), container_id = %container_id, "container running");

        match self
            .runtime
            .follow_logs(&spec.name, session.logs().clone())
            .await
        {
            Ok(follower) => session.follower = Some(follower),
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "could not attach to container logs");
            }
        }
        Ok(())
    }

    /// Stops `session`. Safe to call any number of times.
    pub async fn stop(&self, session: &mut SandboxSession) {
        teardown(self.runtime.as_ref(), &self.ports, session).await;
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("ports", &self.ports)
            .field("available_slots", &self.available_slots())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Removes the container and returns its port. No-op once stopped.
///
/// Removal errors are logged and swallowed so they never mask the failure
/// that led here.
pub(crate) async fn teardown(
    runtime: &dyn ContainerRuntime,
    ports: &PortAllocator,
    session: &mut SandboxSession,
) {
    if session.state() == SessionState::Stopped {
        return;
    }

    if let Some(follower) = session.follower.take() {
        follower.stop();
    }

    if let Err(e) = runtime.remove(session.container_name()).await {
        tracing::warn!(
            session_id = %session.id(),
            container = %session.container_name(),
            error = %e,
            "failed to remove sandbox container"
        );
    }

    ports.release(session.host_port());
    session.transition(SessionState::Stopped);
    tracing::info!(session_id = %session.id(), port = session.host_port(), "sandbox stopped");
}
