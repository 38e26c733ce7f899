use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{NodeOutput, NodeStatus, RunId, RunStatus};

/// Typed progress event emitted while a run executes.
///
/// A stream always opens with `Meta` and closes with exactly one of
/// `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ProgressEvent {
    Meta(MetaPayload),
    NodeStatus(NodeStatusPayload),
    NodeProgress(NodeProgressPayload),
    Complete(CompletePayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaPayload {
    pub run_id: RunId,
    pub project_id: String,
    pub total_nodes: usize,
    #[serde(default)]
    pub levels: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusPayload {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<NodeOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProgressPayload {
    pub node_id: String,
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    #[serde(default)]
    pub failed_nodes: Vec<String>,
    #[serde(default)]
    pub skipped_nodes: Vec<String>,
    #[serde(default)]
    pub canceled_nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub message: String,
}

impl ProgressEvent {
    pub fn node_status(node_id: impl Into<String>, status: NodeStatus) -> Self {
        Self::NodeStatus(NodeStatusPayload {
            node_id: node_id.into(),
            status,
            output: None,
            error: None,
            elapsed_ms: None,
        })
    }

    pub fn error(run_id: Option<RunId>, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            run_id,
            message: message.into(),
        })
    }

    /// Wire name used as the frame's `event:` line.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Meta(_) => "meta",
            Self::NodeStatus(_) => "node_status",
            Self::NodeProgress(_) => "node_progress",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
        }
    }

    /// `complete` and `error` close a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }
}

#[derive(Debug)]
struct SinkState {
    /// Dropped on close so receivers see end-of-stream.
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

/// Ordered, close-once event channel shared by the coordinator and handlers.
///
/// Once a terminal event has been sent (or `close` called) every further
/// send is dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    state: Arc<Mutex<SinkState>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            state: Arc::new(Mutex::new(SinkState { tx: Some(tx) })),
        };
        (sink, rx)
    }

    /// Send an event. Returns false if the sink was already closed.
    pub fn send(&self, event: ProgressEvent) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let Some(tx) = &state.tx else {
            tracing::debug!(event = event.event_type(), "Dropping event after close");
            return false;
        };
        let terminal = event.is_terminal();
        // Ignore error if the observer went away
        let _ = tx.send(event);
        if terminal {
            state.tx = None;
        }
        true
    }

    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.tx = None;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.tx.is_none()).unwrap_or(true)
    }

    /// Reporter bound to one node of this run.
    pub fn reporter(&self, node_id: impl Into<String>) -> ProgressReporter {
        ProgressReporter {
            node_id: node_id.into(),
            sink: Some(self.clone()),
        }
    }
}

/// Handle a handler uses to publish `node_progress` events for its node.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    node_id: String,
    sink: Option<EventSink>,
}

impl ProgressReporter {
    /// Reporter that discards everything.
    pub fn noop(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            sink: None,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish a percentage; clamped to `0..=100`.
    pub fn report(&self, progress: f64) {
        if let Some(sink) = &self.sink {
            let progress = if progress.is_nan() {
                0.0
            } else {
                progress.clamp(0.0, 100.0)
            };
            sink.send(ProgressEvent::NodeProgress(NodeProgressPayload {
                node_id: self.node_id.clone(),
                progress,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = ProgressEvent::node_status("n1", NodeStatus::Running);
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "node_status");
        assert_eq!(v["payload"], json!({"nodeId": "n1", "status": "running"}));
        assert_eq!(event.event_type(), "node_status");
        assert!(!event.is_terminal());
        assert!(ProgressEvent::error(None, "x").is_terminal());
    }

    #[tokio::test]
    async fn test_sink_closes_after_terminal_event() {
        let (sink, mut rx) = EventSink::channel();
        assert!(sink.send(ProgressEvent::node_status("a", NodeStatus::Running)));
        assert!(sink.send(ProgressEvent::error(None, "store down")));
        assert!(!sink.send(ProgressEvent::node_status("a", NodeStatus::Failed)));
        assert!(sink.is_closed());
        drop(sink);

        let mut received = vec![];
        while let Some(e) = rx.recv().await {
            received.push(e);
        }
        assert_eq!(received.len(), 2);
        assert!(received[1].is_terminal());
    }

    #[tokio::test]
    async fn test_reporter_clamps() {
        let (sink, mut rx) = EventSink::channel();
        let reporter = sink.reporter("img");
        reporter.report(140.0);
        reporter.report(-3.0);
        match rx.recv().await.unwrap() {
            ProgressEvent::NodeProgress(p) => {
                assert_eq!(p.node_id, "img");
                assert_eq!(p.progress, 100.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ProgressEvent::NodeProgress(p) => assert_eq!(p.progress, 0.0),
            other => panic!("unexpected event: {:?}", other),
        }
        ProgressReporter::noop("x").report(50.0);
    }
}
