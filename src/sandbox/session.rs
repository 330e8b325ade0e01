//! Sandbox session state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::logs::{LogBuffer, LogFollower};

/// Number of console lines attached to readiness failures.
pub const FAILURE_LOG_LINES: usize = 50;

/// Lifecycle of a sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    Ready,
    Failed,
    Stopped,
}

/// One running (or formerly running) sandbox container.
#[derive(Debug)]
pub struct SandboxSession {
    id: String,
    container_name: String,
    image: String,
    host_port: u16,
    container_port: u16,
    base_url: String,
    code_root: PathBuf,
    mount_source: PathBuf,
    state: SessionState,
    history: Vec<SessionState>,
    logs: LogBuffer,
    pub(crate) follower: Option<LogFollower>,
}

impl SandboxSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        image: String,
        host_port: u16,
        container_port: u16,
        probe_host: &str,
        code_root: PathBuf,
        mount_source: PathBuf,
        log_capacity: usize,
    ) -> Self {
        Self {
            container_name: format!("code-analyzer-{}", id),
            base_url: format!("http://{}:{}", probe_host, host_port),
            id,
            image,
            host_port,
            container_port,
            code_root,
            mount_source,
            state: SessionState::Created,
            history: vec![SessionState::Created],
            logs: LogBuffer::new(log_capacity),
            follower: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Host port leased for this session.
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn container_port(&self) -> u16 {
        self.container_port
    }

    /// URL the service is reachable at from this host.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Local path of the code tree mounted into the container.
    pub fn code_root(&self) -> &Path {
        &self.code_root
    }

    /// The same tree as the container daemon sees it.
    pub fn mount_source(&self) -> &Path {
        &self.mount_source
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has been in, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// The last lines of console output.
    pub fn log_tail(&self) -> String {
        self.logs.tail(FAILURE_LOG_LINES)
    }

    /// Records a readiness success.
    pub fn mark_ready(&mut self) {
        self.transition(SessionState::Ready);
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::debug!(session = %self.id, from = ?self.state, to = ?next, "session state change");
        self.state = next;
        self.history.push(next);
    }
}
