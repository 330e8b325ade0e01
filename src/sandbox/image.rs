//! Base image selection from project markers.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Image used when no ecosystem marker is found.
pub const FALLBACK_IMAGE: &str = "ubuntu:22.04";

/// Ecosystem detected from manifest files at the project root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    Node,
    Python,
    Rust,
    Go,
    Generic,
}

impl ProjectKind {
    /// Inspects `root` for manifest files. The first match wins, in the
    /// order Node, Python, Rust, Go.
    pub fn detect(root: &Path) -> Self {
        if root.join("package.json").exists() {
            ProjectKind::Node
        } else if ["pyproject.toml", "setup.py", "requirements.txt"]
            .iter()
            .any(|f| root.join(f).exists())
        {
            ProjectKind::Python
        } else if root.join("Cargo.toml").exists() {
            ProjectKind::Rust
        } else if root.join("go.mod").exists() {
            ProjectKind::Go
        } else {
            ProjectKind::Generic
        }
    }

    /// Container image for this ecosystem.
    pub fn image(self) -> &'static str {
        match self {
            ProjectKind::Node => "node:20-slim",
            ProjectKind::Python => "python:3.12-slim",
            ProjectKind::Rust => "rust:1.75-slim",
            ProjectKind::Go => "golang:1.21-alpine",
            ProjectKind::Generic => FALLBACK_IMAGE,
        }
    }
}

impl std::fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProjectKind::Node => "nodejs",
            ProjectKind::Python => "python",
            ProjectKind::Rust => "rust",
            ProjectKind::Go => "go",
            ProjectKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Picks the base image for the project at `root`.
pub fn select_image(root: &Path) -> &'static str {
    ProjectKind::detect(root).image()
}
