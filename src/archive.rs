//! Uploaded archive extraction.
//!
//! Each run unpacks its archive into a private workspace directory that is
//! deleted when the [`CodeTree`] is dropped.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;

use crate::error::{Error, Result};

/// Entries whose presence marks a directory as a project root.
const PROJECT_INDICATORS: &[&str] = &[
    "package.json",
    "pyproject.toml",
    "setup.py",
    "Cargo.toml",
    "go.mod",
    "pom.xml",
    "build.gradle",
    "Makefile",
    "README.md",
    "src",
    "lib",
    "app",
];

/// Caps on what one archive may unpack to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackLimits {
    pub max_entries: usize,
    /// Total bytes written across all files.
    pub max_bytes: u64,
}

impl Default for UnpackLimits {
    fn default() -> Self {
        Self {
            max_entries: 20_000,
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// An extracted code tree owned by a single run.
#[derive(Debug)]
pub struct CodeTree {
    root: PathBuf,
    file_count: usize,
    workspace: TempDir,
}

impl CodeTree {
    /// Extracts `archive` into a fresh workspace under `base_dir`.
    pub async fn extract(
        archive: Vec<u8>,
        base_dir: PathBuf,
        limits: UnpackLimits,
    ) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::extract_blocking(&archive, &base_dir, limits))
            .await
            .map_err(|e| Error::Extraction(format!("extraction task failed: {}", e)))?
    }

    /// Synchronous variant of [`CodeTree::extract`].
    pub fn extract_blocking(
        archive: &[u8],
        base_dir: &Path,
        limits: UnpackLimits,
    ) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        let workspace = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(base_dir)?;
        let extract_dir = workspace.path().join("extracted");
        std::fs::create_dir_all(&extract_dir)?;

        let file_count = unpack(archive, &extract_dir, limits)?;
        let root = project_root(&extract_dir)?;

        tracing::info!(root = ?root, files = file_count, "extracted code archive");

        Ok(Self {
            root,
            file_count,
            workspace,
        })
    }

    /// Project root inside the workspace.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspace directory holding the extraction.
    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Number of files unpacked.
    pub fn file_count(&self) -> usize {
        self.file_count
    }
}

fn unpack(archive: &[u8], out_dir: &Path, limits: UnpackLimits) -> Result<usize> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| Error::Extraction(format!("invalid ZIP file: {}", e)))?;

    if zip.len() > limits.max_entries {
        return Err(Error::Extraction(format!(
            "archive has {} entries, limit is {}",
            zip.len(),
            limits.max_entries
        )));
    }

    // Validate every entry before writing anything.
    let mut entries = Vec::with_capacity(zip.len());
    let mut declared: u64 = 0;
    for i in 0..zip.len() {
        let file = zip
            .by_index(i)
            .map_err(|e| Error::Extraction(format!("corrupt ZIP entry {}: {}", i, e)))?;
        let rel = sanitize_rel_path(file.name())?;
        declared = declared.saturating_add(file.size());
        if declared > limits.max_bytes {
            return Err(too_large(limits));
        }
        entries.push(rel);
    }

    // Declared sizes can lie, so the budget is enforced on the bytes written too.
    let mut budget = limits.max_bytes;
    let mut files = 0;
    for (i, rel) in entries.into_iter().enumerate() {
        let mut file = zip
            .by_index(i)
            .map_err(|e| Error::Extraction(format!("corrupt ZIP entry {}: {}", i, e)))?;
        let out_path = out_dir.join(&rel);

        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&out_path)?;
        let written = std::io::copy(&mut (&mut file).take(budget.saturating_add(1)), &mut out)
            .map_err(|e| {
                Error::Extraction(format!("failed to write {}: {}", rel.display(), e))
            })?;
        if written > budget {
            return Err(too_large(limits));
        }
        budget -= written;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode().map(|m| m & 0o777).filter(|m| *m != 0) {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode | 0o600))?;
        }

        files += 1;
    }

    Ok(files)
}

fn too_large(limits: UnpackLimits) -> Error {
    Error::Extraction(format!(
        "archive expands beyond {}MB",
        limits.max_bytes / (1024 * 1024)
    ))
}

fn sanitize_rel_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(Error::Extraction(format!("unsafe path in ZIP: {}", name)));
            }
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
        }
    }
    Ok(out)
}

/// Picks the project root: a lone top-level directory that looks like a
/// project, otherwise the extraction directory itself.
fn project_root(extract_dir: &Path) -> Result<PathBuf> {
    let entries: Vec<PathBuf> = std::fs::read_dir(extract_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.file_name().map_or(true, |n| n != "__MACOSX"))
        .collect();

    if let [single] = entries.as_slice() {
        if single.is_dir() && looks_like_project_root(single) {
            return Ok(single.clone());
        }
    }

    Ok(extract_dir.to_path_buf())
}

fn looks_like_project_root(dir: &Path) -> bool {
    PROJECT_INDICATORS
        .iter()
        .any(|indicator| dir.join(indicator).exists())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    /// Builds an in-memory ZIP from (name, contents) pairs.
    pub(crate) fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn extract_default(archive: &[u8], base_dir: &Path) -> Result<CodeTree> {
        CodeTree::extract_blocking(archive, base_dir, UnpackLimits::default())
    }

    #[test]
    fn extracts_flat_archive() {
        let base = TempDir::new().unwrap();
        let archive = zip_bytes(&[
            ("package.json", "{}"),
            ("src/index.js", "console.log('hi')"),
        ]);

        let tree = extract_default(&archive, base.path()).unwrap();

        assert_eq!(tree.file_count(), 2);
        assert!(tree.root().join("package.json").exists());
        assert!(tree.root().join("src/index.js").exists());
        assert!(tree.workspace().starts_with(base.path()));
    }

    #[test]
    fn unwraps_single_project_directory() {
        let base = TempDir::new().unwrap();
        let archive = zip_bytes(&[
            ("forum-api/package.json", "{}"),
            ("forum-api/src/main.ts", "bootstrap()"),
        ]);

        let tree = extract_default(&archive, base.path()).unwrap();

        assert!(tree.root().ends_with("forum-api"));
        assert!(tree.root().join("package.json").exists());
    }

    #[test]
    fn keeps_single_directory_without_project_markers() {
        let base = TempDir::new().unwrap();
        let archive = zip_bytes(&[("notes/todo.txt", "x")]);

        let tree = extract_default(&archive, base.path()).unwrap();

        assert!(tree.root().ends_with("extracted"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let base = TempDir::new().unwrap();
        let archive = zip_bytes(&[("../evil.sh", "rm -rf /")]);

        let err = extract_default(&archive, base.path()).unwrap_err();
        assert!(matches!(err, Error::Extraction(msg) if msg.contains("unsafe path")));
    }

    #[test]
    fn rejects_garbage_bytes() {
        let base = TempDir::new().unwrap();
        let err = extract_default(b"not a zip", base.path()).unwrap_err();
        assert_eq!(err.kind(), "extraction_error");
    }

    #[test]
    fn workspace_removed_on_drop() {
        let base = TempDir::new().unwrap();
        let archive = zip_bytes(&[("main.py", "print('hi')")]);

        let workspace = {
            let tree = extract_default(&archive, base.path()).unwrap();
            tree.workspace().to_path_buf()
        };

        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn async_extract_runs_off_thread() {
        let base = TempDir::new().unwrap();
        let archive = zip_bytes(&[("go.mod", "module x")]);

        let tree = CodeTree::extract(archive, base.path().to_path_buf(), UnpackLimits::default())
            .await
            .unwrap();
        assert!(tree.root().join("go.mod").exists());
    }

    #[test]
    fn rejects_archives_with_too_many_entries() {
        let base = TempDir::new().unwrap();
        let archive = zip_bytes(&[("a.js", "1"), ("b.js", "2"), ("c.js", "3")]);
        let limits = UnpackLimits {
            max_entries: 2,
            ..Default::default()
        };

        let err = CodeTree::extract_blocking(&archive, base.path(), limits).unwrap_err();
        assert!(matches!(err, Error::Extraction(msg) if msg.contains("3 entries")));
    }

    #[test]
    fn rejects_archives_that_expand_past_budget() {
        let base = TempDir::new().unwrap();
        let big = "a".repeat(4096);
        let archive = zip_bytes(&[("package.json", "{}"), ("blob.txt", big.as_str())]);
        let limits = UnpackLimits {
            max_bytes: 1024,
            ..Default::default()
        };

        let err = CodeTree::extract_blocking(&archive, base.path(), limits).unwrap_err();
        assert_eq!(err.kind(), "extraction_error");
        assert!(err.to_string().contains("archive expands beyond"));
    }

    #[test]
    fn archive_within_limits_extracts() {
        let base = TempDir::new().unwrap();
        let archive = zip_bytes(&[("main.py", "print('hi')")]);
        let limits = UnpackLimits {
            max_entries: 1,
            max_bytes: 11,
        };

        let tree = CodeTree::extract_blocking(&archive, base.path(), limits).unwrap();
        assert_eq!(tree.file_count(), 1);
    }
}
