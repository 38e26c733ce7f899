use tracing::debug;

use flowforge_core::event::{
    CompletePayload, EventSink, MetaPayload, NodeStatusPayload, ProgressEvent, ProgressReporter,
};
use flowforge_core::types::{NodeOutput, NodeStatus, RunId, RunStatus};

use crate::context::RunContext;

/// Typed front for a run's event sink.
///
/// Emits `meta` first and exactly one closing `complete` or `error`; the
/// sink drops anything sent after the closing event.
#[derive(Debug, Clone)]
pub struct ProgressStreamer {
    sink: EventSink,
}

impl ProgressStreamer {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }

    pub fn meta(&self, ctx: &RunContext) {
        self.emit(ProgressEvent::Meta(MetaPayload {
            run_id: ctx.run_id.clone(),
            project_id: ctx.project_id.clone(),
            total_nodes: ctx.total_nodes(),
            levels: ctx.levels().to_vec(),
        }));
    }

    pub fn running(&self, node_id: &str) {
        self.emit(ProgressEvent::node_status(node_id, NodeStatus::Running));
    }

    pub fn succeeded(&self, node_id: &str, output: NodeOutput, elapsed_ms: u64) {
        self.emit(ProgressEvent::NodeStatus(NodeStatusPayload {
            node_id: node_id.to_string(),
            status: NodeStatus::Succeeded,
            output: Some(output),
            error: None,
            elapsed_ms: Some(elapsed_ms),
        }));
    }

    pub fn failed(&self, node_id: &str, error: &str, elapsed_ms: Option<u64>) {
        self.emit(ProgressEvent::NodeStatus(NodeStatusPayload {
            node_id: node_id.to_string(),
            status: NodeStatus::Failed,
            output: None,
            error: Some(error.to_string()),
            elapsed_ms,
        }));
    }

    pub fn skipped(&self, node_id: &str) {
        self.emit(ProgressEvent::node_status(node_id, NodeStatus::Skipped));
    }

    pub fn canceled(&self, node_id: &str) {
        self.emit(ProgressEvent::node_status(node_id, NodeStatus::Canceled));
    }

    /// Closing tally for a run that reached the end of its schedule (or was canceled).
    pub fn complete(&self, ctx: &RunContext, status: RunStatus) {
        self.emit(ProgressEvent::Complete(CompletePayload {
            run_id: ctx.run_id.clone(),
            status,
            completed_nodes: ctx.completed_nodes(),
            total_nodes: ctx.total_nodes(),
            failed_nodes: ctx.nodes_with(NodeStatus::Failed),
            skipped_nodes: ctx.nodes_with(NodeStatus::Skipped),
            canceled_nodes: ctx.nodes_with(NodeStatus::Canceled),
        }));
    }

    /// Closing event for a fatal run failure.
    pub fn error(&self, run_id: Option<&RunId>, message: impl Into<String>) {
        self.emit(ProgressEvent::error(run_id.cloned(), message));
    }

    pub fn reporter(&self, node_id: &str) -> ProgressReporter {
        self.sink.reporter(node_id)
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    fn emit(&self, event: ProgressEvent) {
        let event_type = event.event_type();
        if !self.sink.send(event) {
            debug!(event = event_type, "Progress stream already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use flowforge_core::graph::{Graph, Node, NodeKind};

    #[tokio::test]
    async fn test_stream_shape_and_close() {
        let nodes = vec![Node::new("a", NodeKind::Input)];
        let graph = Arc::new(Graph::new(nodes, vec![]));
        let mut ctx = RunContext::new(
            RunId::from_string("r1"),
            "proj",
            graph,
            vec![vec!["a".into()]],
        );
        ctx.queue_all();

        let (sink, mut rx) = EventSink::channel();
        let streamer = ProgressStreamer::new(sink);
        streamer.meta(&ctx);
        streamer.running("a");
        ctx.transition("a", NodeStatus::Running).unwrap();
        ctx.record_success("a", NodeOutput::text("hi")).unwrap();
        streamer.succeeded("a", NodeOutput::text("hi"), 12);
        streamer.complete(&ctx, RunStatus::Completed);
        streamer.error(None, "too late");
        assert!(streamer.is_closed());
        drop(streamer);

        let mut types = vec![];
        let mut last = None;
        while let Some(event) = rx.recv().await {
            types.push(event.event_type());
            last = Some(event);
        }
        assert_eq!(types, vec!["meta", "node_status", "node_status", "complete"]);
        match last.unwrap() {
            ProgressEvent::Complete(c) => {
                assert_eq!(c.completed_nodes, 1);
                assert_eq!(c.total_nodes, 1);
                assert!(c.failed_nodes.is_empty());
            }
            other => panic!("unexpected closing event: {:?}", other),
        }
    }
}
