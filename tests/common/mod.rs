//! Shared fixtures for integration tests.
//!
//! `LocalRuntime` stands in for Docker: "starting a container" binds a small
//! axum app on the published host port, and removal shuts it down.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use code_analyzer::collaborators::CodeAnalysis;
use code_analyzer::error::{Result, SandboxStartError};
use code_analyzer::sandbox::{LogBuffer, LogFollower};
use code_analyzer::{
    Collaborators, ContainerRuntime, ContainerSpec, FeatureAnalysis, FeatureLocator,
    ImplementationLocation, Pipeline, PortAllocator, SandboxManager, Settings, StartupPlan,
    StartupPlanner, TestGenerator,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use zip::write::SimpleFileOptions;

/// Fake container engine backed by in-process HTTP servers.
#[derive(Default)]
pub struct LocalRuntime {
    /// Serve `/health` on the published port.
    pub serve: bool,
    /// Delay before a started app accepts connections.
    pub boot_delay: Duration,
    pub servers: Mutex<HashMap<String, JoinHandle<()>>>,
    pub runs: Mutex<Vec<ContainerSpec>>,
    pub removed: Mutex<Vec<String>>,
    pub active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl LocalRuntime {
    pub fn serving() -> Self {
        Self {
            serve: true,
            ..Default::default()
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.runs.lock().unwrap().iter().map(|s| s.host_port).collect()
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn ensure_image(&self, _image: &str) -> std::result::Result<(), SandboxStartError> {
        Ok(())
    }

    async fn run_detached(
        &self,
        spec: &ContainerSpec,
    ) -> std::result::Result<String, SandboxStartError> {
        self.runs.lock().unwrap().push(spec.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);

        if self.serve {
            let port = spec.host_port;
            let delay = self.boot_delay;
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                    .await
                    .unwrap();
                let app = Router::new().route("/health", get(|| async { "ok" }));
                axum::serve(listener, app).await.unwrap();
            });
            self.servers.lock().unwrap().insert(spec.name.clone(), task);
        }
        Ok(spec.name.clone())
    }

    async fn follow_logs(&self, _name: &str, buffer: LogBuffer) -> Result<LogFollower> {
        buffer.push("> node index.js");
        buffer.push("Error: listen EADDRINUSE");
        Ok(LogFollower::detached())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        if let Some(task) = self.servers.lock().unwrap().remove(name) {
            task.abort();
        }
        self.removed.lock().unwrap().push(name.to_string());
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collaborators with canned answers. The generated "tests" are shell scripts.
pub struct Scripted {
    pub test_script: String,
}

impl Scripted {
    pub fn passing() -> Self {
        Self {
            test_script: "echo \"GET $BASE_URL/health\"\necho 'VERDICT: PASS'\n".to_string(),
        }
    }

    pub fn with_script(script: &str) -> Self {
        Self {
            test_script: script.to_string(),
        }
    }
}

#[async_trait]
impl FeatureLocator for Scripted {
    async fn locate(&self, _problem: &str, code_root: &Path) -> Result<CodeAnalysis> {
        assert!(code_root.join("package.json").exists());
        Ok(CodeAnalysis {
            feature_analysis: vec![FeatureAnalysis {
                feature_description: "Create a channel".into(),
                implementation_location: vec![ImplementationLocation {
                    file: "index.js".into(),
                    function: "createChannel".into(),
                    lines: "4-9".into(),
                }],
            }],
            execution_plan_suggestion: "npm install && npm start".into(),
        })
    }
}

#[async_trait]
impl StartupPlanner for Scripted {
    async fn plan(&self, _code_root: &Path) -> Result<StartupPlan> {
        Ok(StartupPlan::new("npm start", "/health").with_install_command("npm install"))
    }
}

#[async_trait]
impl TestGenerator for Scripted {
    async fn generate(
        &self,
        _problem: &str,
        _features: &[FeatureAnalysis],
        base_url: &str,
    ) -> Result<String> {
        assert!(base_url.starts_with("http://127.0.0.1:"));
        Ok(self.test_script.clone())
    }
}

/// Builds a ZIP archive in memory.
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A small Node project wrapped in a top-level directory.
pub fn node_project() -> Vec<u8> {
    zip_archive(&[
        ("forum/package.json", r#"{"scripts":{"start":"node index.js"}}"#),
        ("forum/index.js", "const http = require('http');\n"),
    ])
}

/// Settings tuned for fast tests: short health budget, `sh` as test runner.
pub fn test_settings(uploads: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.upload.dir = uploads.to_path_buf();
    settings.probe.health_timeout_secs = 1;
    settings.probe.poll_interval_ms = 100;
    settings.probe.request_timeout_secs = 1;
    settings.executor.command = vec!["sh".into()];
    settings.executor.file_extension = "sh".into();
    settings.executor.timeout_secs = 10;
    settings
}

pub struct Fixture {
    pub pipeline: Arc<Pipeline>,
    pub runtime: Arc<LocalRuntime>,
    pub settings: Settings,
    _uploads: TempDir,
}

impl Fixture {
    pub fn leased_ports(&self) -> Vec<u16> {
        self.pipeline.sandboxes().ports().leased()
    }
}

/// Wires a pipeline around `runtime` with ports from a private block
/// starting at `first_port`.
pub fn fixture(
    runtime: LocalRuntime,
    collaborators: Scripted,
    first_port: u16,
    max_sessions: usize,
) -> Fixture {
    let uploads = TempDir::new().unwrap();
    let mut settings = test_settings(uploads.path());
    settings.sandbox.max_sessions = max_sessions;
    settings.sandbox.port_range_start = first_port;
    settings.sandbox.port_range_end = first_port + 19;

    let runtime = Arc::new(runtime);
    let ports = PortAllocator::new(first_port, first_port + 19);
    let manager =
        SandboxManager::with_ports(runtime.clone(), settings.sandbox.clone(), Arc::new(ports));
    let pipeline = Pipeline::new(
        Collaborators::shared(Arc::new(collaborators)),
        Arc::new(manager),
        &settings,
    )
    .unwrap();

    Fixture {
        pipeline: Arc::new(pipeline),
        runtime,
        settings,
        _uploads: uploads,
    }
}
