//! Error types for the code analyzer.

use std::time::Duration;

use thiserror::Error;

/// Failure modes of bringing up a sandbox container.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxStartError {
    /// The base image could not be found locally or pulled.
    #[error("failed to pull image {image}: {diagnostic}")]
    ImagePullFailed { image: String, diagnostic: String },

    /// No host port could be reserved or bound for the session.
    #[error("failed to bind port {port}: {diagnostic}")]
    PortBindFailed { port: u16, diagnostic: String },

    /// The container runtime refused to create or start the container.
    #[error("failed to start container {container}: {diagnostic}")]
    ContainerStartFailed {
        container: String,
        diagnostic: String,
    },
}

/// Top-level error type for analysis runs.
#[derive(Error, Debug)]
pub enum Error {
    /// The uploaded archive could not be unpacked.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// A reasoning collaborator failed or returned something unusable.
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// The sandbox could not be started.
    #[error("sandbox start failed: {0}")]
    SandboxStart(#[from] SandboxStartError),

    /// The sandbox never answered its readiness check.
    #[error("health check timed out after {}s", waited.as_secs())]
    HealthTimeout { waited: Duration, log_tail: String },

    /// Test code could not be generated.
    #[error("test generation failed: {0}")]
    TestGeneration(String),

    /// Generated tests could not be run at all.
    #[error("test execution failed: {0}")]
    TestExecution(String),

    /// Tearing down a sandbox failed. Logged, never propagated out of a run.
    #[error("cleanup failed for {target}: {reason}")]
    Cleanup { target: String, reason: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error talking to a remote service.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable classification string used in terminal events and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Extraction(_) => "extraction_error",
            Error::Analysis(_) => "analysis_error",
            Error::SandboxStart(_) => "sandbox_start_error",
            Error::HealthTimeout { .. } => "health_timeout",
            Error::TestGeneration(_) => "test_generation_error",
            Error::TestExecution(_) => "test_execution_error",
            Error::Cleanup { .. } => "cleanup_error",
            Error::Config(_) => "config_error",
            Error::Io(_) | Error::Http(_) | Error::Json(_) => "internal_error",
        }
    }

    /// Container console output captured alongside the error, if any.
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            Error::HealthTimeout { log_tail, .. } => Some(log_tail.as_str()),
            _ => None,
        }
    }
}

/// Result type alias for analyzer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::Extraction("x".into()).kind(), "extraction_error");
        assert_eq!(Error::Analysis("x".into()).kind(), "analysis_error");
        assert_eq!(
            Error::HealthTimeout {
                waited: Duration::from_secs(3),
                log_tail: String::new(),
            }
            .kind(),
            "health_timeout"
        );
        assert_eq!(Error::TestGeneration("x".into()).kind(), "test_generation_error");
        assert_eq!(
            Error::Io(std::io::Error::other("boom")).kind(),
            "internal_error"
        );
    }

    #[test]
    fn sandbox_start_errors_carry_diagnostics() {
        let err: Error = SandboxStartError::ImagePullFailed {
            image: "node:20-slim".into(),
            diagnostic: "manifest unknown".into(),
        }
        .into();

        assert_eq!(err.kind(), "sandbox_start_error");
        let msg = err.to_string();
        assert!(msg.contains("node:20-slim"));
        assert!(msg.contains("manifest unknown"));
    }

    #[test]
    fn health_timeout_exposes_log_tail() {
        let err = Error::HealthTimeout {
            waited: Duration::from_secs(180),
            log_tail: "Error: Cannot find module 'express'".into(),
        };

        assert_eq!(err.to_string(), "health check timed out after 180s");
        assert_eq!(err.log_tail(), Some("Error: Cannot find module 'express'"));
        assert_eq!(Error::Analysis("x".into()).log_tail(), None);
    }
}
