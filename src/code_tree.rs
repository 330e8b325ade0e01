//! Source listing for the reasoning collaborators.
//!
//! Walks an extracted project, keeps recognised source files and renders
//! them into a size-bounded prompt section.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::sandbox::ProjectKind;

/// File extensions treated as source code.
const CODE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "rs", "go", "java", "kt", "swift", "rb", "php",
    "cs", "cpp", "c", "h", "hpp",
];

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    ".next",
    "target",
    "vendor",
];

/// Generated lockfiles that only add noise.
const SKIP_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "uv.lock",
    "Cargo.lock",
];

/// Manifests listed in the prompt header and sorted first.
const MANIFEST_FILES: &[&str] = &["package.json", "pyproject.toml", "Cargo.toml", "go.mod"];

/// Files the startup planner looks at.
pub const STARTUP_FILES: &[&str] = &[
    "package.json",
    "docker-compose.yml",
    "docker-compose.yaml",
    "Dockerfile",
    "README.md",
    "pyproject.toml",
    "requirements.txt",
    ".env.example",
    "Makefile",
];

const MAX_FILE_BYTES: u64 = 100 * 1024;
const MAX_STARTUP_FILE_CHARS: usize = 5000;

/// Default prompt budget for source listings.
pub const DEFAULT_PROMPT_CHARS: usize = 100_000;

/// A source file read from the tree.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub extension: String,
    pub content: String,
    pub line_count: usize,
}

/// Source files and metadata for one project.
#[derive(Debug, Clone)]
pub struct ProjectListing {
    pub root: PathBuf,
    pub kind: ProjectKind,
    pub files: Vec<SourceFile>,
    pub manifests: Vec<String>,
}

impl ProjectListing {
    /// Walks `root` and collects its source files.
    pub fn scan(root: &Path) -> Result<Self> {
        let kind = ProjectKind::detect(root);
        let mut files = Vec::new();
        let mut manifests = Vec::new();

        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && entry.depth() > 0
                    && SKIP_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if SKIP_FILES.contains(&name.as_str()) {
                continue;
            }

            let relative = relative_path(root, entry.path());
            if MANIFEST_FILES.contains(&name.as_str()) {
                manifests.push(relative.clone());
            }

            let extension = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default();
            if !CODE_EXTENSIONS.contains(&extension.as_str()) {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > MAX_FILE_BYTES {
                tracing::warn!(path = %relative, size, "skipping large file");
                continue;
            }

            let bytes = match std::fs::read(entry.path()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = %relative, error = %e, "failed to read file");
                    continue;
                }
            };
            if bytes.iter().take(8192).any(|b| *b == 0) {
                continue;
            }

            let content = String::from_utf8_lossy(&bytes).into_owned();
            let line_count = content.lines().count().max(1);
            files.push(SourceFile {
                path: relative,
                extension,
                content,
                line_count,
            });
        }

        tracing::info!(files = files.len(), kind = %kind, "scanned project");

        Ok(Self {
            root: root.to_path_buf(),
            kind,
            files,
            manifests,
        })
    }

    /// Fails when nothing worth analysing was found.
    pub fn ensure_not_empty(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(Error::Analysis(
                "no source code files found in the project".to_string(),
            ));
        }
        Ok(())
    }

    /// Renders the listing as a markdown prompt of at most about `max_chars`.
    pub fn to_prompt(&self, max_chars: usize) -> String {
        let mut out = format!(
            "# Project Analysis\nProject Type: {}\nTotal Files: {}\nConfig Files: {}\n\n---\n",
            self.kind,
            self.files.len(),
            self.manifests.join(", ")
        );

        let mut sorted: Vec<&SourceFile> = self.files.iter().collect();
        sorted.sort_by_key(|f| (!self.manifests.contains(&f.path), f.path.clone()));

        for file in sorted {
            let section = format!(
                "\n## File: {}\n```{}\n{}\n```\n",
                file.path, file.extension, file.content
            );
            if out.len() + section.len() > max_chars {
                tracing::warn!(chars = out.len(), "truncating source listing");
                break;
            }
            out.push_str(&section);
        }

        out
    }
}

/// Reads the startup-relevant files present at the project root.
pub fn startup_files(root: &Path) -> Vec<(String, String)> {
    STARTUP_FILES
        .iter()
        .filter_map(|name| {
            let content = std::fs::read(root.join(name)).ok()?;
            let mut text = String::from_utf8_lossy(&content).into_owned();
            if text.chars().count() > MAX_STARTUP_FILE_CHARS {
                text = text.chars().take(MAX_STARTUP_FILE_CHARS).collect();
                text.push_str("\n... (truncated)");
            }
            Some((name.to_string(), text))
        })
        .collect()
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
