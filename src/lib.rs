//! Code Analyzer - feature location and sandboxed functional verification
//!
//! This library takes an uploaded codebase plus a problem description, asks a
//! reasoning service where each described feature is implemented, and can
//! optionally start the project in an ephemeral container, probe it for
//! readiness, generate functional tests against it and run them.

pub mod archive;
pub mod code_tree;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod llm;
pub mod pipeline;
pub mod ports;
pub mod probe;
pub mod report;
pub mod sandbox;
pub mod server;

pub use error::{Error, Result, SandboxStartError};

pub use archive::{CodeTree, UnpackLimits};
pub use collaborators::{CodeAnalysis, FeatureLocator, StartupPlan, StartupPlanner, TestGenerator};
pub use config::{Settings, Validate, ValidationResult};
pub use events::{
    ChannelSink, EventSink, LastEventSink, NullSink, RecordingSink, Stage, StageEvent,
};
pub use executor::TestExecutor;
pub use llm::AnthropicClient;
pub use pipeline::{AnalysisRequest, Collaborators, Pipeline, PipelineFailure};
pub use ports::PortAllocator;
pub use probe::ReadinessProber;
pub use report::{
    AnalysisReport, ExecutionResult, FeatureAnalysis, ImplementationLocation, VerificationResult,
};
pub use sandbox::{
    ContainerRuntime, ContainerSpec, DockerCli, SandboxManager, SandboxSession, SessionGuard,
    SessionState,
};
pub use server::{router, AppState};
