//! Observer-side projection of a run.
//!
//! [`RunView`] rebuilds per-node and run state from the event sequence alone,
//! either live from progress events or after the fact from stored run events.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use flowforge_core::event::ProgressEvent;
use flowforge_core::types::{NodeOutput, NodeStatus, Run, RunEvent, RunId, RunStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<NodeOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub run_id: Option<RunId>,
    pub project_id: Option<String>,
    pub status: RunStatus,
    pub total_nodes: usize,
    pub levels: Vec<Vec<String>>,
    pub nodes: BTreeMap<String, NodeView>,
    pub failed_nodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a ProgressEvent>) -> Self {
        let mut view = Self::new();
        for event in events {
            view.apply(event);
        }
        view
    }

    /// Fold one event into the view. Events after the closing one are ignored.
    pub fn apply(&mut self, event: &ProgressEvent) {
        if self.is_finished() {
            return;
        }
        match event {
            ProgressEvent::Meta(meta) => {
                self.run_id = Some(meta.run_id.clone());
                self.project_id = Some(meta.project_id.clone());
                self.total_nodes = meta.total_nodes;
                self.levels = meta.levels.clone();
                self.status = RunStatus::Running;
                for id in meta.levels.iter().flatten() {
                    self.nodes.entry(id.clone()).or_default().status = NodeStatus::Queued;
                }
            }
            ProgressEvent::NodeStatus(update) => {
                let node = self.nodes.entry(update.node_id.clone()).or_default();
                node.status = update.status;
                if update.output.is_some() {
                    node.output = update.output.clone();
                }
                if update.error.is_some() {
                    node.error = update.error.clone();
                }
                if update.elapsed_ms.is_some() {
                    node.elapsed_ms = update.elapsed_ms;
                }
            }
            ProgressEvent::NodeProgress(p) => {
                self.nodes.entry(p.node_id.clone()).or_default().progress = Some(p.progress);
            }
            ProgressEvent::Complete(done) => {
                self.status = done.status;
                self.total_nodes = done.total_nodes;
                self.failed_nodes = done.failed_nodes.clone();
            }
            ProgressEvent::Error(err) => {
                self.status = RunStatus::Failed;
                self.error = Some(err.message.clone());
            }
        }
    }

    /// Rebuild a view from a stored run record and its event log.
    pub fn from_record(run: &Run, events: &[RunEvent]) -> Self {
        let mut view = Self {
            run_id: Some(run.id.clone()),
            project_id: Some(run.project_id.clone()),
            status: run.status,
            total_nodes: run.total_nodes,
            error: run.error.clone(),
            ..Self::default()
        };
        for id in &run.execution_order {
            view.nodes.entry(id.clone()).or_default().status = NodeStatus::Queued;
        }
        for event in events {
            let node = view.nodes.entry(event.node_id.clone()).or_default();
            node.status = event.status;
            match event.status {
                NodeStatus::Succeeded => node.output = Some(NodeOutput::from_value(&event.payload)),
                NodeStatus::Failed => {
                    node.error = event.payload.get("error").and_then(Value::as_str).map(String::from);
                    node.elapsed_ms = event.payload.get("elapsedMs").and_then(Value::as_u64);
                }
                _ => {}
            }
        }
        view.failed_nodes = run
            .execution_order
            .iter()
            .filter(|id| view.status_of(id) == Some(NodeStatus::Failed))
            .cloned()
            .collect();
        view
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeView> {
        self.nodes.get(node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn completed_nodes(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Succeeded)
            .count()
    }
}
