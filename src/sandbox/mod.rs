//! Container sandboxes for running uploaded projects.
//!
//! This module provides the [`ContainerRuntime`] trait with a Docker CLI
//! implementation, deterministic image selection, and the
//! [`SandboxManager`] that hands out [`SessionGuard`]s.

mod docker;
mod guard;
mod image;
mod logs;
mod manager;
mod runtime;
mod session;

pub use docker::DockerCli;
pub use guard::SessionGuard;
pub use image::{select_image, ProjectKind, FALLBACK_IMAGE};
pub use logs::{LogBuffer, LogFollower};
pub use manager::{SandboxManager, SESSION_LABEL};
pub use runtime::{ContainerRuntime, ContainerSpec};
pub use session::{SandboxSession, SessionState, FAILURE_LOG_LINES};
