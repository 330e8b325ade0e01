//! HTTP surface tests over a real local listener.

mod common;

use std::time::Duration;

use code_analyzer::server::{self, router, AppState};
use common::{fixture, node_project, Fixture, LocalRuntime, Scripted};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::Value;

async fn serve(fx: &Fixture) -> String {
    let state = AppState::new(fx.pipeline.clone(), fx.settings.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

fn upload(archive: Vec<u8>, file_name: &str, verify: bool) -> Form {
    Form::new()
        .text("problem_description", "Users can create channels")
        .part("code_zip", Part::bytes(archive).file_name(file_name.to_string()))
        .text("run_verification", verify.to_string())
}

/// Parses `data:` lines of an SSE body into JSON events.
fn sse_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

#[tokio::test]
async fn health_reports_service() {
    let fx = fixture(LocalRuntime::serving(), Scripted::passing(), 45000, 2);
    let base = serve(&fx).await;

    let response = reqwest::get(format!("{}/health", base)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "code-analyzer");
}

#[tokio::test]
async fn rejects_non_zip_upload() {
    let fx = fixture(LocalRuntime::serving(), Scripted::passing(), 45020, 2);
    let base = serve(&fx).await;

    let response = reqwest::Client::new()
        .post(format!("{}/analyze", base))
        .multipart(upload(b"plain text".to_vec(), "notes.txt", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "File must be a ZIP archive");
}

#[tokio::test]
async fn rejects_oversized_upload() {
    let mut fx = fixture(LocalRuntime::serving(), Scripted::passing(), 45040, 2);
    fx.settings.upload.max_size = 1024 * 1024;
    let base = serve(&fx).await;

    let response = reqwest::Client::new()
        .post(format!("{}/analyze", base))
        .multipart(upload(vec![0u8; 1024 * 1024 + 512], "big.zip", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "File too large. Max size: 1MB");
}

#[tokio::test]
async fn batch_analysis_returns_report() {
    let fx = fixture(LocalRuntime::serving(), Scripted::passing(), 45060, 2);
    let base = serve(&fx).await;

    let response = reqwest::Client::new()
        .post(format!("{}/analyze", base))
        .multipart(upload(node_project(), "forum.zip", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["feature_analysis"][0]["implementation_location"][0]["function"],
        "createChannel"
    );
    assert_eq!(body["execution_plan_suggestion"], "npm install && npm start");
    assert!(body["functional_verification"].is_null());
    assert_eq!(fx.runtime.run_count(), 0);
}

#[tokio::test]
async fn batch_failure_carries_stage() {
    let fx = fixture(LocalRuntime::serving(), Scripted::passing(), 45080, 2);
    let base = serve(&fx).await;

    let response = reqwest::Client::new()
        .post(format!("{}/analyze", base))
        .multipart(upload(b"PK but not really".to_vec(), "broken.zip", true))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "extraction_error");
    assert_eq!(body["stage"], "extracting");
    assert!(body["partial_report"]["feature_analysis"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn stream_emits_ordered_stage_events() {
    let fx = fixture(LocalRuntime::serving(), Scripted::passing(), 45100, 2);
    let base = serve(&fx).await;

    // The flag is ignored on the streaming endpoint; verification always runs.
    let response = reqwest::Client::new()
        .post(format!("{}/analyze/stream", base))
        .multipart(upload(node_project(), "forum.zip", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    assert_eq!(response.headers()["cache-control"], "no-cache");

    let events = sse_events(&response.text().await.unwrap());
    let stages: Vec<&str> = events
        .iter()
        .map(|event| event["stage"].as_str().unwrap())
        .collect();
    assert_eq!(
        stages,
        vec![
            "extracting",
            "analyzing_code",
            "analyzing_startup",
            "starting_project",
            "waiting_health",
            "generating_tests",
            "running_tests",
            "cleanup",
            "complete",
        ]
    );

    let complete = events.last().unwrap();
    assert_eq!(complete["message"], "Analysis complete");
    assert_eq!(
        complete["data"]["functional_verification"]["execution_result"]["tests_passed"],
        true
    );
    assert!(events[..events.len() - 1]
        .iter()
        .all(|event| event.get("data").is_none()));
    assert!(fx.leased_ports().is_empty());
}

#[tokio::test]
async fn stream_reports_health_timeout_as_error_event() {
    let fx = fixture(LocalRuntime::silent(), Scripted::passing(), 45120, 2);
    let base = serve(&fx).await;

    let response = reqwest::Client::new()
        .post(format!("{}/analyze/stream", base))
        .multipart(upload(node_project(), "forum.zip", true))
        .send()
        .await
        .unwrap();

    let events = sse_events(&response.text().await.unwrap());
    let last = events.last().unwrap();
    assert_eq!(last["stage"], "error");
    assert_eq!(last["data"]["stage"], "waiting_health");
    assert_eq!(last["data"]["kind"], "health_timeout");
    assert_eq!(
        last["data"]["partial_report"]["functional_verification"]["execution_result"]
            ["tests_passed"],
        false
    );
    assert_eq!(events[events.len() - 2]["stage"], "cleanup");
    assert_eq!(fx.runtime.removed().len(), 1);
}

#[tokio::test]
async fn shutdown_waits_for_runs_whose_client_left() {
    let fx = fixture(LocalRuntime::silent(), Scripted::passing(), 45140, 2);
    let state = AppState::new(fx.pipeline.clone(), fx.settings.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(server::serve(listener, state, async move {
        let _ = stopped.await;
    }));

    let mut response = reqwest::Client::new()
        .post(format!("{}/analyze/stream", base))
        .multipart(upload(node_project(), "forum.zip", true))
        .send()
        .await
        .unwrap();
    let mut seen = String::new();
    while !seen.contains("starting_project") {
        let chunk = response.chunk().await.unwrap().expect("stream ended early");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    drop(response);

    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(30), server)
        .await
        .expect("server stopped")
        .unwrap()
        .unwrap();

    assert_eq!(fx.pipeline.in_flight(), 0);
    assert_eq!(fx.runtime.run_count(), 1);
    assert_eq!(fx.runtime.removed().len(), 1);
    assert!(fx.leased_ports().is_empty());
}
