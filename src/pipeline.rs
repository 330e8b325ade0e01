//! Stage pipeline controller.
//!
//! One [`Pipeline::run`] call drives a single analysis request through
//! extraction, feature location and (optionally) sandboxed verification,
//! emitting a [`StageEvent`] before each stage's work starts. The sandbox is
//! held in a [`SessionGuard`] and released in the `cleanup` stage on every
//! path out of verification.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::archive::{CodeTree, UnpackLimits};
use crate::collaborators::{FeatureLocator, StartupPlan, StartupPlanner, TestGenerator};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::events::{EventSink, Stage, StageEvent};
use crate::executor::TestExecutor;
use crate::probe::ReadinessProber;
use crate::report::{AnalysisReport, FeatureAnalysis, VerificationResult};
use crate::sandbox::{SandboxManager, SessionGuard};

/// Message attached to the terminal success event.
pub const COMPLETE_MESSAGE: &str = "Analysis complete";

/// One analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub problem_description: String,
    /// Raw ZIP archive bytes.
    pub archive: Vec<u8>,
    pub run_verification: bool,
}

impl AnalysisRequest {
    pub fn new(problem_description: impl Into<String>, archive: Vec<u8>) -> Self {
        Self {
            problem_description: problem_description.into(),
            archive,
            run_verification: false,
        }
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.run_verification = enabled;
        self
    }
}

/// A run that ended in a stage failure.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct PipelineFailure {
    /// Stage whose work failed.
    pub stage: Stage,
    #[source]
    pub error: Error,
    /// Report fields computed before the failure.
    pub partial: AnalysisReport,
}

impl PipelineFailure {
    /// Payload of the terminal `error` event.
    pub fn to_value(&self) -> serde_json::Value {
        json!({
            "stage": self.stage,
            "kind": self.error.kind(),
            "message": self.error.to_string(),
            "partial_report": self.partial.to_value(),
        })
    }
}

/// The three reasoning collaborators a run consults.
#[derive(Clone)]
pub struct Collaborators {
    pub locator: Arc<dyn FeatureLocator>,
    pub planner: Arc<dyn StartupPlanner>,
    pub generator: Arc<dyn TestGenerator>,
}

impl Collaborators {
    /// Uses one value for all three roles.
    pub fn shared<C>(collaborator: Arc<C>) -> Self
    where
        C: FeatureLocator + StartupPlanner + TestGenerator + 'static,
    {
        Self {
            locator: collaborator.clone(),
            planner: collaborator.clone(),
            generator: collaborator,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Verification stage failure, with whatever test code existed at the time.
struct StageError {
    stage: Stage,
    error: Error,
    test_code: Option<String>,
}

impl StageError {
    fn new(stage: Stage, error: Error) -> Self {
        Self {
            stage,
            error,
            test_code: None,
        }
    }
}

/// Holds one slot in the in-flight run count until dropped.
struct RunToken(Arc<watch::Sender<usize>>);

impl RunToken {
    fn enter(count: &Arc<watch::Sender<usize>>) -> Self {
        count.send_modify(|n| *n += 1);
        Self(Arc::clone(count))
    }
}

impl Drop for RunToken {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Drives analysis requests through their stages.
#[derive(Debug)]
pub struct Pipeline {
    collaborators: Collaborators,
    sandboxes: Arc<SandboxManager>,
    prober: ReadinessProber,
    executor: TestExecutor,
    upload_dir: PathBuf,
    unpack_limits: UnpackLimits,
    health_budget: Duration,
    test_timeout: Duration,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Pipeline {
    pub fn new(
        collaborators: Collaborators,
        sandboxes: Arc<SandboxManager>,
        settings: &Settings,
    ) -> Result<Self> {
        Ok(Self {
            collaborators,
            sandboxes,
            prober: ReadinessProber::new(settings.probe.clone())?,
            executor: TestExecutor::new(settings.executor.clone()),
            upload_dir: settings.upload.dir.clone(),
            unpack_limits: settings.upload.unpack_limits(),
            health_budget: settings.probe.health_timeout(),
            test_timeout: settings.executor.timeout(),
            in_flight: Arc::new(watch::channel(0).0),
        })
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    /// Number of spawned runs that have not finished yet.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Waits until every spawned run has finished, teardown included.
    ///
    /// Each run is bounded by the health budget, the test timeout and the
    /// runtime's command timeouts, so this returns in bounded time.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Runs `request` on its own task.
    ///
    /// The run keeps going if the caller stops listening, so teardown never
    /// depends on a connected client.
    pub fn spawn(
        self: &Arc<Self>,
        request: AnalysisRequest,
        sink: Arc<dyn EventSink>,
    ) -> JoinHandle<std::result::Result<AnalysisReport, PipelineFailure>> {
        let pipeline = Arc::clone(self);
        let token = RunToken::enter(&self.in_flight);
        tokio::spawn(async move {
            let outcome = pipeline.run(request, sink.as_ref()).await;
            drop(token);
            outcome
        })
    }

    /// Runs every stage of `request`, reporting progress to `sink`.
    ///
    /// The terminal event (`complete` or `error`) is emitted here as well.
    pub async fn run(
        &self,
        request: AnalysisRequest,
        sink: &dyn EventSink,
    ) -> std::result::Result<AnalysisReport, PipelineFailure> {
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        tracing::info!(
            run_id = %run_id,
            archive_bytes = request.archive.len(),
            verification = request.run_verification,
            "analysis run started"
        );

        sink.emit(StageEvent::new(Stage::Extracting, "Extracting code archive..."))
            .await;
        let tree = match CodeTree::extract(
            request.archive,
            self.upload_dir.clone(),
            self.unpack_limits,
        )
        .await
        {
            Ok(tree) => tree,
            Err(e) => {
                let error = match e {
                    Error::Extraction(_) => e,
                    other => Error::Extraction(other.to_string()),
                };
                return Err(self
                    .fail(sink, &run_id, Stage::Extracting, error, AnalysisReport::default())
                    .await);
            }
        };

        sink.emit(StageEvent::new(
            Stage::AnalyzingCode,
            "Analyzing code structure with AI...",
        ))
        .await;
        let analysis = match self
            .collaborators
            .locator
            .locate(&request.problem_description, tree.root())
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                return Err(self
                    .fail(sink, &run_id, Stage::AnalyzingCode, e, AnalysisReport::default())
                    .await);
            }
        };

        let mut report = AnalysisReport {
            feature_analysis: analysis.feature_analysis,
            execution_plan_suggestion: analysis.execution_plan_suggestion,
            functional_verification: None,
        };

        if request.run_verification {
            let mut guard = None;
            let outcome = self
                .verify(
                    &request.problem_description,
                    tree.root(),
                    &report.feature_analysis,
                    sink,
                    &mut guard,
                )
                .await;

            // Capture the console before the container goes away.
            let session_tail = guard
                .as_ref()
                .map(|g: &SessionGuard| g.session().log_tail())
                .unwrap_or_default();

            sink.emit(StageEvent::new(
                Stage::Cleanup,
                "Stopping sandbox and releasing resources...",
            ))
            .await;
            if let Some(mut guard) = guard {
                guard.release().await;
            }
            drop(tree);

            match outcome {
                Ok(verification) => report.functional_verification = Some(verification),
                Err(failure) => {
                    let tail = failure
                        .error
                        .log_tail()
                        .map(str::to_string)
                        .unwrap_or(session_tail);
                    let mut log = format!("Error: {}", failure.error);
                    if !tail.trim().is_empty() {
                        log.push_str("\n\nContainer output:\n");
                        log.push_str(&tail);
                    }
                    report.functional_verification = Some(VerificationResult::aborted(
                        failure.test_code.unwrap_or_default(),
                        log,
                    ));
                    return Err(self
                        .terminal_failure(sink, &run_id, failure.stage, failure.error, report)
                        .await);
                }
            }
        } else {
            drop(tree);
        }

        tracing::info!(
            run_id = %run_id,
            features = report.feature_analysis.len(),
            tests_passed = ?report.functional_verification.as_ref().map(|v| v.tests_passed()),
            "analysis run complete"
        );
        sink.emit(StageEvent::new(Stage::Complete, COMPLETE_MESSAGE).with_data(report.to_value()))
            .await;
        Ok(report)
    }

    /// Verification stages. A started sandbox is parked in `slot` so the
    /// caller can release it whatever happens here.
    async fn verify(
        &self,
        problem_description: &str,
        code_root: &Path,
        features: &[FeatureAnalysis],
        sink: &dyn EventSink,
        slot: &mut Option<SessionGuard>,
    ) -> std::result::Result<VerificationResult, StageError> {
        sink.emit(StageEvent::new(
            Stage::AnalyzingStartup,
            "Analyzing how to start the project...",
        ))
        .await;
        let plan = self
            .collaborators
            .planner
            .plan(code_root)
            .await
            .and_then(StartupPlan::normalized)
            .map_err(|e| StageError::new(Stage::AnalyzingStartup, e))?;

        sink.emit(StageEvent::new(
            Stage::StartingProject,
            format!("Starting project: {}", plan.entry_command()),
        ))
        .await;
        let guard = self
            .sandboxes
            .start(&plan, code_root)
            .await
            .map_err(|e| StageError::new(Stage::StartingProject, e.into()))?;
        let guard = slot.insert(guard);
        let base_url = guard.session().base_url().to_string();

        sink.emit(StageEvent::new(
            Stage::WaitingHealth,
            format!("Waiting for service at {}{}...", base_url, plan.health_path),
        ))
        .await;
        self.prober
            .wait_until_ready(guard.session_mut(), &plan.health_path, self.health_budget)
            .await
            .map_err(|e| StageError::new(Stage::WaitingHealth, e))?;

        sink.emit(StageEvent::new(
            Stage::GeneratingTests,
            "Generating functional tests with AI...",
        ))
        .await;
        let test_code = self
            .collaborators
            .generator
            .generate(problem_description, features, &base_url)
            .await
            .map_err(|e| StageError::new(Stage::GeneratingTests, e))?;

        sink.emit(StageEvent::new(Stage::RunningTests, "Running functional tests..."))
            .await;
        self.executor
            .execute(guard.session(), &test_code, &base_url, self.test_timeout)
            .await
            .map_err(|e| StageError {
                stage: Stage::RunningTests,
                error: e,
                test_code: Some(test_code.clone()),
            })
    }

    /// Failure before verification started: run cleanup, then report.
    async fn fail(
        &self,
        sink: &dyn EventSink,
        run_id: &str,
        stage: Stage,
        error: Error,
        partial: AnalysisReport,
    ) -> PipelineFailure {
        sink.emit(StageEvent::new(Stage::Cleanup, "Releasing resources..."))
            .await;
        self.terminal_failure(sink, run_id, stage, error, partial)
            .await
    }

    async fn terminal_failure(
        &self,
        sink: &dyn EventSink,
        run_id: &str,
        stage: Stage,
        error: Error,
        partial: AnalysisReport,
    ) -> PipelineFailure {
        tracing::error!(run_id = %run_id, %stage, kind = error.kind(), error = %error, "analysis run failed");
        let failure = PipelineFailure {
            stage,
            error,
            partial,
        };
        sink.emit(StageEvent::new(Stage::Failed, failure.error.to_string()).with_data(failure.to_value()))
            .await;
        failure
    }
}
