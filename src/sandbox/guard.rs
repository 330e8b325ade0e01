//! Scoped ownership of a running sandbox.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use super::manager::teardown;
use super::runtime::ContainerRuntime;
use super::session::{SandboxSession, SessionState};
use crate::ports::PortAllocator;

/// Owns a [`SandboxSession`] and guarantees it is stopped exactly once.
///
/// Call [`SessionGuard::release`] on every normal path. If the guard is
/// dropped without release (a panic, or the owning task being cancelled),
/// `Drop` schedules the same teardown on the current tokio runtime.
pub struct SessionGuard {
    session: SandboxSession,
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionGuard {
    pub(crate) fn new(
        session: SandboxSession,
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortAllocator>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            session,
            runtime,
            ports,
            permit: Some(permit),
        }
    }

    pub fn session(&self) -> &SandboxSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SandboxSession {
        &mut self.session
    }

    /// Returns true once the session has been stopped.
    pub fn is_released(&self) -> bool {
        self.session.state() == SessionState::Stopped
    }

    /// Stops the session and frees its slot. Later calls do nothing.
    pub async fn release(&mut self) {
        teardown(self.runtime.as_ref(), &self.ports, &mut self.session).await;
        self.permit.take();
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session", &self.session)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }

        let id = self.session.id().to_string();
        let container = self.session.container_name().to_string();
        let port = self.session.host_port();
        let follower = self.session.follower.take();
        self.session.transition(SessionState::Stopped);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(session_id = %id, "sandbox guard dropped without release, scheduling teardown");
                let runtime = self.runtime.clone();
                let ports = self.ports.clone();
                // The slot stays taken until the container is gone.
                let permit = self.permit.take();
                handle.spawn(async move {
                    drop(follower);
                    if let Err(e) = runtime.remove(&container).await {
                        tracing::warn!(session_id = %id, error = %e, "failed to remove sandbox container");
                    }
                    ports.release(port);
                    drop(permit);
                    tracing::info!(session_id = %id, port, "sandbox stopped");
                });
            }
            Err(_) => {
                tracing::error!(
                    session_id = %id,
                    container = %container,
                    "sandbox guard dropped outside a runtime, container may leak"
                );
                self.ports.release(port);
            }
        }
    }
}
