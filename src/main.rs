//! Code Analyzer HTTP service
//!
//! Configuration comes from defaults, an optional TOML file named by
//! `CODE_ANALYZER_CONFIG`, and environment overrides.

use std::sync::Arc;

use code_analyzer::config::Validate;
use code_analyzer::server::{self, AppState};
use code_analyzer::{AnthropicClient, Collaborators, DockerCli, Pipeline, SandboxManager, Settings};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.server.log_level)),
        )
        .init();

    if let Err(e) = run(settings).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> code_analyzer::Result<()> {
    for warning in settings.validate().into_result()? {
        tracing::warn!("{}", warning);
    }
    tracing::info!(config = ?settings, "configuration loaded");

    let runtime = Arc::new(DockerCli::new(settings.sandbox.command_timeout()));
    let sandboxes = SandboxManager::new(runtime, settings.sandbox.clone())
        .with_upload(settings.upload.clone());
    let llm = Arc::new(AnthropicClient::new(settings.llm.clone())?);
    let pipeline = Pipeline::new(
        Collaborators::shared(llm),
        Arc::new(sandboxes),
        &settings,
    )?;

    let listener = TcpListener::bind(("0.0.0.0", settings.server.port)).await?;
    let state = AppState::new(Arc::new(pipeline), settings);
    server::serve(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
