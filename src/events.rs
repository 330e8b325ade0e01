//! Stage progress events and the sinks that consume them.
//!
//! The pipeline is the only producer. A sink either forwards events live to
//! a transport (streaming mode) or keeps just the terminal one (batch mode).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extracting,
    AnalyzingCode,
    AnalyzingStartup,
    StartingProject,
    WaitingHealth,
    GeneratingTests,
    RunningTests,
    Cleanup,
    Complete,
    /// Terminal failure. Serialized as `error` on the wire.
    #[serde(rename = "error")]
    Failed,
}

impl Stage {
    /// Returns true for `Complete` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    /// Returns true for stages that only run when verification is requested.
    pub fn is_verification(self) -> bool {
        matches!(
            self,
            Stage::AnalyzingStartup
                | Stage::StartingProject
                | Stage::WaitingHealth
                | Stage::GeneratingTests
                | Stage::RunningTests
        )
    }

    /// Wire name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extracting => "extracting",
            Stage::AnalyzingCode => "analyzing_code",
            Stage::AnalyzingStartup => "analyzing_startup",
            Stage::StartingProject => "starting_project",
            Stage::WaitingHealth => "waiting_health",
            Stage::GeneratingTests => "generating_tests",
            Stage::RunningTests => "running_tests",
            Stage::Cleanup => "cleanup",
            Stage::Complete => "complete",
            Stage::Failed => "error",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: Stage,
    pub message: String,
    /// Present only on terminal events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl StageEvent {
    /// Creates a progress event without payload.
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Renders the event as one server-sent-events frame.
    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"stage":"{}","message":"unserializable event"}}"#, self.stage)
        });
        format!("data: {}\n\n", json)
    }
}

/// Receives stage events from a pipeline run.
///
/// Emitting never fails from the pipeline's point of view; a sink that can
/// no longer deliver (for example a disconnected client) must drop events
/// quietly so the run still reaches teardown.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StageEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: StageEvent) {}
}

/// Batch-mode sink that keeps only the most recent event.
#[derive(Debug, Default)]
pub struct LastEventSink {
    last: Mutex<Option<StageEvent>>,
}

impl LastEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the last event seen, if any.
    pub fn take(&self) -> Option<StageEvent> {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl EventSink for LastEventSink {
    async fn emit(&self, event: StageEvent) {
        *self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(event);
    }
}

/// Keeps every event in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StageEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all events recorded so far.
    pub fn events(&self) -> Vec<StageEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Returns the stages recorded so far.
    pub fn stages(&self) -> Vec<Stage> {
        self.events().into_iter().map(|e| e.stage).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: StageEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Streaming-mode sink forwarding into a bounded channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<StageEvent>,
    disconnected: AtomicBool,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StageEvent>) -> Self {
        Self {
            tx,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Creates a sink plus the receiving half of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StageEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Returns true once the receiver has gone away.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: StageEvent) {
        if self.is_disconnected() {
            return;
        }
        let stage = event.stage;
        if self.tx.send(event).await.is_err() {
            self.disconnected.store(true, Ordering::Relaxed);
            tracing::warn!(%stage, "event receiver dropped, run continues without a client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_serialize_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&Stage::AnalyzingCode).unwrap(),
            "\"analyzing_code\""
        );
        assert_eq!(
            serde_json::to_string(&Stage::WaitingHealth).unwrap(),
            "\"waiting_health\""
        );
        assert_eq!(serde_json::to_string(&Stage::Failed).unwrap(), "\"error\"");
        assert_eq!(Stage::Failed.to_string(), "error");
        assert_eq!(Stage::RunningTests.to_string(), "running_tests");
    }

    #[test]
    fn terminal_and_verification_flags() {
        assert!(Stage::Complete.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Cleanup.is_terminal());
        assert!(Stage::WaitingHealth.is_verification());
        assert!(!Stage::Cleanup.is_verification());
        assert!(!Stage::AnalyzingCode.is_verification());
    }

    #[test]
    fn event_without_data_omits_field() {
        let event = StageEvent::new(Stage::Extracting, "Extracting code archive...");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"stage":"extracting","message":"Extracting code archive..."}"#
        );
    }

    #[test]
    fn sse_frame_format() {
        let event = StageEvent::new(Stage::Complete, "done")
            .with_data(serde_json::json!({"feature_analysis": []}));
        let frame = event.to_sse_frame();

        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains(r#""stage":"complete""#));
        assert!(frame.contains(r#""data":{"feature_analysis":[]}"#));
    }

    #[tokio::test]
    async fn last_event_sink_keeps_only_last() {
        let sink = LastEventSink::new();
        sink.emit(StageEvent::new(Stage::Extracting, "a")).await;
        sink.emit(StageEvent::new(Stage::Complete, "b")).await;

        let last = sink.take().unwrap();
        assert_eq!(last.stage, Stage::Complete);
        assert!(sink.take().is_none());
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::channel(8);
        sink.emit(StageEvent::new(Stage::Extracting, "1")).await;
        sink.emit(StageEvent::new(Stage::AnalyzingCode, "2")).await;

        assert_eq!(rx.recv().await.unwrap().stage, Stage::Extracting);
        assert_eq!(rx.recv().await.unwrap().stage, Stage::AnalyzingCode);
    }

    #[tokio::test]
    async fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::channel(1);
        drop(rx);

        sink.emit(StageEvent::new(Stage::Extracting, "1")).await;
        sink.emit(StageEvent::new(Stage::Cleanup, "2")).await;

        assert!(sink.is_disconnected());
    }
}
