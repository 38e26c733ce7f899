//! Shared mocks and graph fixtures for flowforge tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use flowforge_core::error::{FlowError, Result};
use flowforge_core::graph::{
    Cardinality, CombineParams, CombineStrategy, Edge, GraphSubmission, InputParams, Node,
    NodeKind, NodeParams, Port, TextParams,
};
use flowforge_core::traits::{GraphStore, OperationHandler, RunStore};
use flowforge_core::types::{NodeOutput, NodeStatus, OperationRequest, Run, RunEvent, RunId, RunUpdate};

// ── Run store ───────────────────────────────────────────────────

/// Store operation that a [`MemoryRunStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateRun,
    UpdateRun,
    /// Appending an event with this status.
    AppendEvent(NodeStatus),
}

#[derive(Default)]
struct StoreState {
    runs: HashMap<RunId, Run>,
    events: Vec<RunEvent>,
    graphs: HashMap<String, GraphSubmission>,
    fail: Option<FailPoint>,
}

/// In-memory `RunStore` + `GraphStore`.
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that errors whenever `point` is hit.
    pub fn failing(point: FailPoint) -> Self {
        let store = Self::new();
        store.state.lock().unwrap().fail = Some(point);
        store
    }

    pub fn run(&self, run_id: &RunId) -> Option<Run> {
        self.state.lock().unwrap().runs.get(run_id).cloned()
    }

    pub fn runs(&self) -> Vec<Run> {
        self.state.lock().unwrap().runs.values().cloned().collect()
    }

    pub fn events(&self, run_id: &RunId) -> Vec<RunEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| &e.run_id == run_id)
            .cloned()
            .collect()
    }

    /// `(node_id, status)` pairs in append order.
    pub fn transitions(&self, run_id: &RunId) -> Vec<(String, NodeStatus)> {
        self.events(run_id)
            .into_iter()
            .map(|e| (e.node_id, e.status))
            .collect()
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if self.state.lock().unwrap().fail == Some(point) {
            return Err(FlowError::Store(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }
}

impl RunStore for MemoryRunStore {
    fn create_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let result = self.check(FailPoint::CreateRun).map(|()| {
            self.state
                .lock()
                .unwrap()
                .runs
                .insert(run.id.clone(), run.clone());
        });
        Box::pin(async move { result })
    }

    fn update_run(&self, run_id: &RunId, update: RunUpdate) -> BoxFuture<'_, Result<()>> {
        let result = self.check(FailPoint::UpdateRun).and_then(|()| {
            let mut state = self.state.lock().unwrap();
            let run = state
                .runs
                .get_mut(run_id)
                .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;
            if let Some(status) = update.status {
                run.status = status;
            }
            if let Some(order) = update.execution_order {
                run.execution_order = order;
            }
            if let Some(total) = update.total_nodes {
                run.total_nodes = total;
            }
            if let Some(completed) = update.completed_nodes {
                run.completed_nodes = run.completed_nodes.max(completed);
            }
            if update.started_at.is_some() {
                run.started_at = update.started_at;
            }
            if update.finished_at.is_some() {
                run.finished_at = update.finished_at;
            }
            if update.error.is_some() {
                run.error = update.error;
            }
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn append_run_event(
        &self,
        run_id: &RunId,
        node_id: &str,
        status: NodeStatus,
        payload: Value,
    ) -> BoxFuture<'_, Result<()>> {
        let result = self.check(FailPoint::AppendEvent(status)).map(|()| {
            self.state.lock().unwrap().events.push(RunEvent {
                run_id: run_id.clone(),
                node_id: node_id.to_string(),
                status,
                payload,
                timestamp: Utc::now(),
            });
        });
        Box::pin(async move { result })
    }

    fn get_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        let run = self.run(run_id);
        Box::pin(async move { Ok(run) })
    }

    fn run_events(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<RunEvent>>> {
        let events = self.events(run_id);
        Box::pin(async move { Ok(events) })
    }
}

impl GraphStore for MemoryRunStore {
    fn save_graph(&self, submission: &GraphSubmission) -> BoxFuture<'_, Result<()>> {
        self.state
            .lock()
            .unwrap()
            .graphs
            .insert(submission.project_id.clone(), submission.clone());
        Box::pin(async { Ok(()) })
    }

    fn load_graph(&self, project_id: &str) -> BoxFuture<'_, Result<Option<GraphSubmission>>> {
        let graph = self.state.lock().unwrap().graphs.get(project_id).cloned();
        Box::pin(async move { Ok(graph) })
    }
}

// ── Scripted handler ────────────────────────────────────────────

/// What a [`ScriptedHandler`] does for one node.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed(NodeOutput),
    Fail(String),
    /// Sleep, then succeed.
    Delay(Duration, NodeOutput),
    Panic(String),
    /// Never finish on its own.
    Hang,
    /// Report each percentage, then succeed.
    Progress(Vec<f64>, NodeOutput),
}

#[derive(Default)]
struct ScriptState {
    scripts: HashMap<String, Script>,
    calls: Vec<String>,
    inputs: HashMap<String, Map<String, Value>>,
}

/// Handler driven by per-node scripts. Unscripted nodes succeed with the
/// text `"<node_id> done"`. Clones share state, so a test can keep one
/// clone after registering another.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    state: Arc<Mutex<ScriptState>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, node_id: &str, script: Script) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(node_id.to_string(), script);
        self
    }

    /// Node ids in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn was_called(&self, node_id: &str) -> bool {
        self.calls().iter().any(|c| c == node_id)
    }

    /// Inputs the handler received for a node.
    pub fn inputs_of(&self, node_id: &str) -> Option<Map<String, Value>> {
        self.state.lock().unwrap().inputs.get(node_id).cloned()
    }

    /// Highest number of concurrent invocations observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl OperationHandler for ScriptedHandler {
    fn name(&self) -> &str {
        "scripted"
    }

    fn operate(&self, request: OperationRequest) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let script = {
                let mut state = self.state.lock().unwrap();
                state.calls.push(request.node_id.clone());
                state
                    .inputs
                    .insert(request.node_id.clone(), request.inputs.clone());
                state.scripts.get(&request.node_id).cloned()
            };

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard(self.running.clone());

            match script {
                None => Ok(NodeOutput::text(format!("{} done", request.node_id))),
                Some(Script::Succeed(output)) => Ok(output),
                Some(Script::Fail(message)) => Err(FlowError::node(&request.node_id, message)),
                Some(Script::Delay(delay, output)) => {
                    tokio::time::sleep(delay).await;
                    Ok(output)
                }
                Some(Script::Panic(message)) => panic!("{}", message),
                Some(Script::Hang) => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                Some(Script::Progress(steps, output)) => {
                    for step in steps {
                        request.progress.report(step);
                        tokio::task::yield_now().await;
                    }
                    Ok(output)
                }
            }
        })
    }
}

// ── Graph fixtures ──────────────────────────────────────────────

pub fn text_input(id: &str, text: &str) -> Node {
    Node::new(id, NodeKind::Input)
        .with_output(Port::output("text", "text/plain"))
        .with_params(NodeParams::Input(InputParams {
            value: Some(json!(text)),
            output_type: None,
        }))
}

/// Generation node with one required input and one output.
pub fn generator(id: &str, kind: NodeKind, input_type: &str, output_type: &str) -> Node {
    let node = Node::new(id, kind)
        .with_input(Port::input("prompt", input_type))
        .with_output(Port::output("out", output_type));
    if kind == NodeKind::GenerateText {
        node.with_params(NodeParams::GenerateText(TextParams {
            model: Some("test-model".into()),
            ..Default::default()
        }))
    } else {
        node
    }
}

pub fn relay(id: &str) -> Node {
    Node::new(id, NodeKind::Transform)
        .with_input(Port::input("in", "any"))
        .with_output(Port::output("out", "any"))
}

pub fn combine(id: &str, max_inputs: u32, strategy: CombineStrategy) -> Node {
    Node::new(id, NodeKind::Combine)
        .with_input(
            Port::input("parts", "any").with_cardinality(Cardinality::at_most(max_inputs)),
        )
        .with_output(Port::output("out", "any"))
        .with_params(NodeParams::Combine(CombineParams {
            strategy,
            separator: Some(" + ".into()),
        }))
}

pub fn output(id: &str) -> Node {
    Node::new(id, NodeKind::Output).with_input(Port::input("in", "any"))
}

pub fn edge(id: &str, source: (&str, &str), target: (&str, &str)) -> Edge {
    Edge::new(id, source, target)
}

pub fn submission(project_id: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> GraphSubmission {
    GraphSubmission {
        project_id: project_id.to_string(),
        nodes,
        edges,
    }
}

/// `input(text) -> generate-image -> generate-video`.
pub fn chain_submission() -> GraphSubmission {
    submission(
        "chain",
        vec![
            text_input("prompt", "a lighthouse at dusk"),
            generator("image", NodeKind::GenerateImage, "text/*", "image/png"),
            generator("video", NodeKind::GenerateVideo, "image/*", "video/mp4"),
        ],
        vec![
            edge("e1", ("prompt", "text"), ("image", "prompt")),
            edge("e2", ("image", "out"), ("video", "prompt")),
        ],
    )
}

/// Two independent two-node branches feeding one `combine` (max 2 inputs).
///
/// Levels: `[left_src, right_src]`, `[left_gen, right_gen]`, `[mix]`.
pub fn two_branch_submission() -> GraphSubmission {
    submission(
        "branches",
        vec![
            text_input("left_src", "left"),
            text_input("right_src", "right"),
            generator("left_gen", NodeKind::GenerateText, "text/plain", "text/plain"),
            generator("right_gen", NodeKind::GenerateText, "text/plain", "text/plain"),
            combine("mix", 2, CombineStrategy::Concat),
        ],
        vec![
            edge("e1", ("left_src", "text"), ("left_gen", "prompt")),
            edge("e2", ("right_src", "text"), ("right_gen", "prompt")),
            edge("e3", ("left_gen", "out"), ("mix", "parts")),
            edge("e4", ("right_gen", "out"), ("mix", "parts")),
        ],
    )
}
