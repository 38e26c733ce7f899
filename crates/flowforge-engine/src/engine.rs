use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flowforge_core::config::EngineConfig;
use flowforge_core::error::{FlowError, Result};
use flowforge_core::event::{EventSink, ProgressEvent};
use flowforge_core::graph::{
    Graph, GraphSubmission, GraphValidation, IssueKind, ValidationIssue,
};
use flowforge_core::traits::RunStore;
use flowforge_core::types::RunId;

use crate::context::RunContext;
use crate::executor::{Executor, ExecutorConfig, RunOutcome};
use crate::handlers::HandlerRegistry;
use crate::progress::ProgressStreamer;
use crate::scheduler::compute_levels;
use crate::validator::validate_graph;

/// Entry point for running graphs.
///
/// Validation and scheduling happen synchronously in [`Engine::start`]; the
/// run itself executes on a spawned coordinator task.
#[derive(Clone)]
pub struct Engine {
    executor: Arc<Executor>,
    active: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl Engine {
    pub fn new(registry: HandlerRegistry, store: Arc<dyn RunStore>, config: EngineConfig) -> Self {
        Self {
            executor: Arc::new(Executor::new(registry, store, ExecutorConfig::from(config))),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn validate(submission: &GraphSubmission) -> GraphValidation {
        validate_graph(&submission.nodes, &submission.edges)
    }

    /// Validate and compute dependency levels.
    pub fn plan(submission: &GraphSubmission) -> Result<Vec<Vec<String>>> {
        let report = Self::validate(submission);
        if !report.valid {
            return Err(FlowError::InvalidGraph(report));
        }
        compute_levels(&submission.nodes, &submission.edges).ok_or_else(|| {
            FlowError::InvalidGraph(GraphValidation::from_errors(vec![ValidationIssue {
                kind: IssueKind::Cycle,
                node_id: None,
                edge_id: None,
                message: "graph contains a cycle".to_string(),
            }]))
        })
    }

    /// Start a run. Must be called from within a tokio runtime.
    pub fn start(&self, submission: GraphSubmission) -> Result<RunHandle> {
        let levels = Self::plan(&submission)?;
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let (sink, events) = EventSink::channel();

        let graph = Arc::new(Graph::new(submission.nodes, submission.edges));
        let ctx = RunContext::new(run_id.clone(), submission.project_id, graph, levels);

        if let Ok(mut active) = self.active.lock() {
            active.insert(run_id.clone(), cancel.clone());
        }
        info!(run_id = %run_id, project_id = %ctx.project_id, "Run accepted");

        let executor = self.executor.clone();
        let active = self.active.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let streamer = ProgressStreamer::new(sink);
            let outcome = executor.execute(ctx, &streamer, &token).await;
            if let Ok(mut active) = active.lock() {
                active.remove(&outcome.run_id);
            }
            outcome
        });

        Ok(RunHandle {
            run_id,
            events,
            cancel,
            task,
        })
    }

    /// Request cancellation of an active run. Returns false if the run is
    /// unknown or already finished.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let token = self
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(run_id).cloned());
        match token {
            Some(token) => {
                debug!(run_id = %run_id, "Cancel requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(run_id))
            .unwrap_or(false)
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.active
            .lock()
            .map(|active| active.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Handle to a started run: its event stream and a cancel switch.
pub struct RunHandle {
    pub run_id: RunId,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    cancel: CancellationToken,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Next event; `None` once the run has closed its stream.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Event stream; the run keeps going if the stream is dropped.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        stream::unfold(self.events, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }

    /// Wait for the run to end, discarding any unread events.
    pub async fn wait(self) -> Result<RunOutcome> {
        self.task
            .await
            .map_err(|e| FlowError::Task(e.to_string()))
    }

    /// Drain every event, then wait for the outcome.
    pub async fn collect(mut self) -> (Vec<ProgressEvent>, Result<RunOutcome>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, self.wait().await)
    }
}
