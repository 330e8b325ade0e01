//! HTTP surface.
//!
//! - `GET /health` liveness probe
//! - `POST /analyze` one JSON report per request
//! - `POST /analyze/stream` stage events as server-sent events
//!
//! Both analysis endpoints take a multipart form with `problem_description`,
//! `code_zip` and an optional `run_verification` flag. Runs are spawned onto
//! their own tasks so a dropped connection never interrupts sandbox teardown.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::events::{ChannelSink, LastEventSink, StageEvent};
use crate::pipeline::{AnalysisRequest, Pipeline, PipelineFailure};

/// Name reported by the health endpoint.
pub const SERVICE_NAME: &str = "code-analyzer";

/// Room for multipart framing and text fields on top of the archive limit.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Events buffered per stream before the run waits on the client.
const EVENT_BUFFER: usize = 32;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, settings: Settings) -> Self {
        Self {
            pipeline,
            settings: Arc::new(settings),
        }
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.upload.max_size.saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/analyze/stream", post(analyze_stream))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");
    let pipeline = Arc::clone(&state.pipeline);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    // Runs outlive their connections, so the listener closing is not enough.
    let pending = pipeline.in_flight();
    if pending > 0 {
        tracing::info!(pending, "waiting for in-flight analysis runs to tear down");
    }
    pipeline.wait_idle().await;
    tracing::info!("server stopped");
    Ok(())
}

impl Error {
    /// HTTP status for an error surfaced through the API.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Extraction(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error response: `{error, type, stage?, partial_report?}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({"error": message.into(), "type": "validation_error"}),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({"error": message.into(), "type": "internal_error"}),
        }
    }
}

impl From<PipelineFailure> for ApiError {
    fn from(failure: PipelineFailure) -> Self {
        Self {
            status: failure.error.status_code(),
            body: json!({
                "error": failure.error.to_string(),
                "type": failure.error.kind(),
                "stage": failure.stage,
                "partial_report": failure.partial.to_value(),
            }),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        Self {
            status: e.status(),
            body: json!({"error": e.body_text(), "type": "validation_error"}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": SERVICE_NAME}))
}

async fn analyze(
    State(state): State<AppState>,
    multipart: Multipart,
) -> std::result::Result<Response, ApiError> {
    let request = read_form(multipart, state.settings.upload.max_size).await?;

    let sink = Arc::new(LastEventSink::new());
    let outcome = state
        .pipeline
        .spawn(request, sink.clone())
        .await
        .map_err(|e| ApiError::internal(format!("analysis task failed: {}", e)))?;
    tracing::debug!(last_stage = ?sink.take().map(|event| event.stage), "batch run finished");

    match outcome {
        Ok(report) => Ok(Json(report).into_response()),
        Err(failure) => Err(failure.into()),
    }
}

async fn analyze_stream(
    State(state): State<AppState>,
    multipart: Multipart,
) -> std::result::Result<Response, ApiError> {
    let request = read_form(multipart, state.settings.upload.max_size)
        .await?
        .with_verification(true);

    let (sink, rx) = ChannelSink::channel(EVENT_BUFFER);
    let run = state.pipeline.spawn(request, Arc::new(sink));
    tokio::spawn(async move {
        match run.await {
            Ok(Ok(_)) => {}
            Ok(Err(failure)) => tracing::debug!(error = %failure, "streamed run ended in failure"),
            Err(e) => tracing::error!(error = %e, "streamed analysis task failed"),
        }
    });

    let events = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(sse_event(&event)));
    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Sse::new(events).keep_alive(KeepAlive::default())).into_response())
}

fn sse_event(event: &StageEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            tracing::warn!(stage = %event.stage, error = %e, "could not serialize stage event");
            Event::default().data(json!({"stage": event.stage, "message": event.message}).to_string())
        }
    }
}

/// Reads the upload form, enforcing the archive name and size rules.
async fn read_form(
    mut multipart: Multipart,
    max_size: usize,
) -> std::result::Result<AnalysisRequest, ApiError> {
    let mut problem_description = None;
    let mut archive = None;
    let mut run_verification = false;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "problem_description" => problem_description = Some(field.text().await?),
            "code_zip" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                if !file_name.to_ascii_lowercase().ends_with(".zip") {
                    return Err(ApiError::bad_request("File must be a ZIP archive"));
                }
                let bytes = field.bytes().await?;
                if bytes.len() > max_size {
                    return Err(ApiError::bad_request(format!(
                        "File too large. Max size: {}MB",
                        max_size / (1024 * 1024)
                    )));
                }
                tracing::info!(file = %file_name, bytes = bytes.len(), "received upload");
                archive = Some(bytes.to_vec());
            }
            "run_verification" => run_verification = parse_flag(&field.text().await?),
            other => tracing::debug!(field = other, "ignoring unknown form field"),
        }
    }

    let problem_description = problem_description
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("problem_description is required"))?;
    let archive = archive.ok_or_else(|| ApiError::bad_request("code_zip is required"))?;

    Ok(AnalysisRequest::new(problem_description, archive).with_verification(run_verification))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
