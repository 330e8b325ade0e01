//! Contracts for the reasoning collaborators.
//!
//! The pipeline treats each collaborator as a replaceable black box. The
//! [`crate::llm`] module implements all three against a hosted model; tests
//! substitute scripted fakes.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::report::FeatureAnalysis;

/// Feature locations plus a suggestion for running the project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAnalysis {
    #[serde(default)]
    pub feature_analysis: Vec<FeatureAnalysis>,
    #[serde(default)]
    pub execution_plan_suggestion: String,
}

/// How to bring the project up inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupPlan {
    /// Image the planner would have picked. Recorded, never used.
    #[serde(default, alias = "base_image")]
    pub base_image_hint: Option<String>,
    /// Entry command of the container.
    #[serde(default)]
    pub start_command: String,
    /// Runs before `start_command` when present.
    #[serde(default)]
    pub install_command: Option<String>,
    /// Path polled for readiness.
    #[serde(
        default = "default_health_path",
        alias = "health_check_url",
        deserialize_with = "health_path_or_root"
    )]
    pub health_path: String,
    /// Port the service listens on inside the container.
    #[serde(default)]
    pub service_port: Option<u16>,
    #[serde(default, alias = "env_vars")]
    pub env: BTreeMap<String, String>,
}

fn default_health_path() -> String {
    "/".to_string()
}

fn health_path_or_root<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_health_path))
}

impl Default for StartupPlan {
    fn default() -> Self {
        Self {
            base_image_hint: None,
            start_command: String::new(),
            install_command: None,
            health_path: default_health_path(),
            service_port: None,
            env: BTreeMap::new(),
        }
    }
}

impl StartupPlan {
    /// Creates a plan with just a start command and health path.
    pub fn new(start_command: impl Into<String>, health_path: impl Into<String>) -> Self {
        Self {
            start_command: start_command.into(),
            health_path: normalize_health_path(&health_path.into()),
            ..Default::default()
        }
    }

    pub fn with_install_command(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    pub fn with_service_port(mut self, port: u16) -> Self {
        self.service_port = Some(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Rejects plans that cannot start anything and tidies the health path.
    pub fn normalized(mut self) -> Result<Self> {
        if self.start_command.trim().is_empty() {
            return Err(Error::Analysis(
                "could not determine how to start the project".to_string(),
            ));
        }
        self.health_path = normalize_health_path(&self.health_path);
        if self
            .install_command
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
        {
            self.install_command = None;
        }
        Ok(self)
    }

    /// Full shell command run as the container entrypoint.
    pub fn entry_command(&self) -> String {
        match &self.install_command {
            Some(install) => format!("{} && {}", install.trim(), self.start_command.trim()),
            None => self.start_command.trim().to_string(),
        }
    }
}

/// Reduces a health path or full URL to an absolute path.
///
/// Planners sometimes answer with `http://localhost:3000/health`; only the
/// path survives since the host side is decided by the sandbox.
pub fn normalize_health_path(raw: &str) -> String {
    let raw = raw.trim();
    let path = match raw.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |idx| &rest[idx..]),
        None => raw,
    };

    if path.is_empty() || path == "null" {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Locates feature implementations in a code tree.
#[async_trait]
pub trait FeatureLocator: Send + Sync {
    async fn locate(&self, problem_description: &str, code_root: &Path) -> Result<CodeAnalysis>;
}

/// Decides how to start a project.
#[async_trait]
pub trait StartupPlanner: Send + Sync {
    async fn plan(&self, code_root: &Path) -> Result<StartupPlan>;
}

/// Authors test code exercising the located features against a live service.
#[async_trait]
pub trait TestGenerator: Send + Sync {
    async fn generate(
        &self,
        problem_description: &str,
        features: &[FeatureAnalysis],
        base_url: &str,
    ) -> Result<String>;
}
