use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowforge_core::config::EngineConfig;
use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::{OperationHandler, RunStore};
use flowforge_core::types::{
    NodeOutput, NodeStatus, OperationRequest, Run, RunId, RunStatus, RunUpdate,
};

use crate::context::RunContext;
use crate::handlers::HandlerRegistry;
use crate::progress::ProgressStreamer;

/// Limits applied while executing a run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_nodes: usize,
    pub node_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        EngineConfig::default().into()
    }
}

impl From<EngineConfig> for ExecutorConfig {
    fn from(config: EngineConfig) -> Self {
        Self {
            max_concurrent_nodes: config.max_concurrent_nodes.max(1),
            node_timeout_secs: config.node_timeout_secs,
        }
    }
}

/// Final tally of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    pub failed_nodes: Vec<String>,
    pub skipped_nodes: Vec<String>,
    pub canceled_nodes: Vec<String>,
    pub error: Option<String>,
}

impl RunOutcome {
    fn from_context(ctx: &RunContext, status: RunStatus, error: Option<String>) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            status,
            completed_nodes: ctx.completed_nodes(),
            total_nodes: ctx.total_nodes(),
            failed_nodes: ctx.nodes_with(NodeStatus::Failed),
            skipped_nodes: ctx.nodes_with(NodeStatus::Skipped),
            canceled_nodes: ctx.nodes_with(NodeStatus::Canceled),
            error,
        }
    }
}

/// What a node task hands back to the coordinator.
struct NodeResult {
    node_id: String,
    elapsed: Duration,
    result: Result<NodeOutput>,
    permit: OwnedSemaphorePermit,
}

/// Runs a scheduled graph level by level.
///
/// The coordinator (the task calling [`Executor::execute`]) is the only
/// writer of run state. Node tasks get owned inputs and hand their result
/// back through the level's `JoinSet`.
pub struct Executor {
    registry: HandlerRegistry,
    store: Arc<dyn RunStore>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(registry: HandlerRegistry, store: Arc<dyn RunStore>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute a run to its end. Never returns early without closing the
    /// event stream.
    pub async fn execute(
        &self,
        mut ctx: RunContext,
        streamer: &ProgressStreamer,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let run = Run {
            id: ctx.run_id.clone(),
            project_id: ctx.project_id.clone(),
            status: RunStatus::Running,
            execution_order: ctx.execution_order(),
            total_nodes: ctx.total_nodes(),
            completed_nodes: 0,
            started_at: Some(Utc::now()),
            finished_at: None,
            error: None,
        };
        if let Err(e) = self.store.create_run(&run).await {
            error!(run_id = %ctx.run_id, error = %e, "Failed to create run record");
            streamer.error(Some(&ctx.run_id), e.to_string());
            return RunOutcome::from_context(&ctx, RunStatus::Failed, Some(e.to_string()));
        }

        info!(
            run_id = %ctx.run_id,
            project_id = %ctx.project_id,
            total_nodes = ctx.total_nodes(),
            levels = ctx.levels().len(),
            "Run started"
        );
        streamer.meta(&ctx);
        ctx.queue_all();

        let result = match self.run_levels(&mut ctx, streamer, cancel).await {
            Ok(()) => self.finish(&mut ctx, streamer, cancel).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(status) => {
                info!(
                    run_id = %ctx.run_id,
                    status = %status,
                    completed_nodes = ctx.completed_nodes(),
                    failed = ctx.nodes_with(NodeStatus::Failed).len(),
                    skipped = ctx.nodes_with(NodeStatus::Skipped).len(),
                    "Run finished"
                );
                RunOutcome::from_context(&ctx, status, None)
            }
            Err(e) => self.fail_run(&ctx, streamer, e).await,
        }
    }

    async fn run_levels(
        &self,
        ctx: &mut RunContext,
        streamer: &ProgressStreamer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_nodes));
        let levels = ctx.levels().to_vec();

        for (index, level) in levels.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(run_id = %ctx.run_id, level = index, "Run canceled, stopping dispatch");
                break;
            }
            debug!(run_id = %ctx.run_id, level = index, nodes = level.len(), "Dispatching level");

            let mut tasks = JoinSet::new();
            let result = self
                .run_level(ctx, level, streamer, cancel, &semaphore, &mut tasks)
                .await;
            if result.is_err() {
                tasks.shutdown().await;
            }
            result?;
        }
        Ok(())
    }

    /// Dispatch one level, then wait for every task in it.
    ///
    /// A node holds a concurrency permit from its `running` transition until
    /// its result has been recorded, so the stream never shows more nodes
    /// running than the cap allows. Nodes waiting for a permit stay queued.
    async fn run_level(
        &self,
        ctx: &mut RunContext,
        level: &[String],
        streamer: &ProgressStreamer,
        cancel: &CancellationToken,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<NodeResult>,
    ) -> Result<()> {
        for node_id in level {
            if cancel.is_cancelled() {
                break;
            }
            let Some(node) = ctx.graph().node(node_id).cloned() else {
                continue;
            };

            if ctx.should_skip(node_id) {
                ctx.transition(node_id, NodeStatus::Skipped)?;
                self.store
                    .append_run_event(
                        &ctx.run_id,
                        node_id,
                        NodeStatus::Skipped,
                        json!({"reason": "upstream node did not succeed"}),
                    )
                    .await?;
                streamer.skipped(node_id);
                debug!(run_id = %ctx.run_id, node_id = %node_id, "Node skipped");
                continue;
            }

            let permit = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        self.settle(ctx, joined, streamer, cancel).await?;
                    }
                    permit = semaphore.clone().acquire_owned() => {
                        break Some(permit.map_err(|_| FlowError::Cancelled)?);
                    }
                }
            };
            let Some(permit) = permit else {
                debug!(run_id = %ctx.run_id, node_id = %node_id, "Canceled while queued");
                break;
            };

            ctx.transition(node_id, NodeStatus::Running)?;
            self.store
                .append_run_event(&ctx.run_id, node_id, NodeStatus::Running, Value::Null)
                .await?;
            streamer.running(node_id);

            let request = OperationRequest {
                run_id: ctx.run_id.clone(),
                node_id: node_id.clone(),
                kind: node.kind,
                inputs: ctx.assemble_inputs(&node),
                ports: node.inputs.iter().map(|p| p.name.clone()).collect(),
                params: node.params.clone(),
                progress: streamer.reporter(node_id),
            };
            tasks.spawn(
                NodeTask {
                    handler: self.registry.get(node.kind),
                    request,
                    cancel: cancel.clone(),
                    permit,
                    default_timeout_secs: self.config.node_timeout_secs,
                }
                .run(),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            self.settle(ctx, joined, streamer, cancel).await?;
        }

        // A task that died without reporting leaves its node running.
        for node_id in level {
            if ctx.status(node_id) == Some(NodeStatus::Running) {
                self.mark_failed(ctx, node_id, "node task terminated unexpectedly", None, streamer)
                    .await?;
            }
        }
        Ok(())
    }

    /// Record one finished node task. Its permit is released afterwards.
    async fn settle(
        &self,
        ctx: &mut RunContext,
        joined: std::result::Result<NodeResult, JoinError>,
        streamer: &ProgressStreamer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let NodeResult {
            node_id,
            elapsed,
            result,
            permit,
        } = match joined {
            Ok(r) => r,
            Err(join_err) => {
                error!(run_id = %ctx.run_id, error = %join_err, "Node task terminated abnormally");
                return Ok(());
            }
        };
        let elapsed_ms = elapsed.as_millis() as u64;

        match result {
            // Results arriving after cancellation are discarded.
            _ if cancel.is_cancelled() => {
                self.mark_canceled(ctx, &node_id, streamer).await?;
            }
            Ok(output) => {
                ctx.record_success(&node_id, output.clone())?;
                self.store
                    .append_run_event(
                        &ctx.run_id,
                        &node_id,
                        NodeStatus::Succeeded,
                        output.to_value(),
                    )
                    .await?;
                self.store
                    .update_run(&ctx.run_id, RunUpdate::completed_nodes(ctx.completed_nodes()))
                    .await?;
                streamer.succeeded(&node_id, output, elapsed_ms);
                info!(run_id = %ctx.run_id, node_id = %node_id, elapsed_ms, "Node succeeded");
            }
            Err(e) => {
                self.mark_failed(ctx, &node_id, &e.to_string(), Some(elapsed_ms), streamer)
                    .await?;
            }
        }
        drop(permit);
        Ok(())
    }

    async fn mark_failed(
        &self,
        ctx: &mut RunContext,
        node_id: &str,
        message: &str,
        elapsed_ms: Option<u64>,
        streamer: &ProgressStreamer,
    ) -> Result<()> {
        warn!(run_id = %ctx.run_id, node_id = %node_id, error = %message, "Node failed");
        ctx.record_failure(node_id, message)?;
        self.store
            .append_run_event(
                &ctx.run_id,
                node_id,
                NodeStatus::Failed,
                json!({"error": message, "elapsedMs": elapsed_ms}),
            )
            .await?;
        streamer.failed(node_id, message, elapsed_ms);
        Ok(())
    }

    async fn mark_canceled(
        &self,
        ctx: &mut RunContext,
        node_id: &str,
        streamer: &ProgressStreamer,
    ) -> Result<()> {
        ctx.transition(node_id, NodeStatus::Canceled)?;
        self.store
            .append_run_event(&ctx.run_id, node_id, NodeStatus::Canceled, Value::Null)
            .await?;
        streamer.canceled(node_id);
        Ok(())
    }

    /// Cancel leftovers, write the terminal run record, close the stream.
    async fn finish(
        &self,
        ctx: &mut RunContext,
        streamer: &ProgressStreamer,
        cancel: &CancellationToken,
    ) -> Result<RunStatus> {
        if cancel.is_cancelled() {
            for node_id in ctx.unfinished() {
                self.mark_canceled(ctx, &node_id, streamer).await?;
            }
        }
        let status = if ctx.nodes_with(NodeStatus::Canceled).is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Canceled
        };

        let update = RunUpdate {
            completed_nodes: Some(ctx.completed_nodes()),
            ..RunUpdate::finished(status, None)
        };
        self.store.update_run(&ctx.run_id, update).await?;
        streamer.complete(ctx, status);
        Ok(status)
    }

    /// Fatal path: best-effort `failed` record, then a closing `error` event.
    async fn fail_run(
        &self,
        ctx: &RunContext,
        streamer: &ProgressStreamer,
        err: FlowError,
    ) -> RunOutcome {
        let message = err.to_string();
        error!(run_id = %ctx.run_id, error = %message, "Run failed");
        let update = RunUpdate::finished(RunStatus::Failed, Some(message.clone()));
        if let Err(e) = self.store.update_run(&ctx.run_id, update).await {
            warn!(run_id = %ctx.run_id, error = %e, "Could not record run failure");
        }
        streamer.error(Some(&ctx.run_id), message.clone());
        RunOutcome::from_context(ctx, RunStatus::Failed, Some(message))
    }
}

/// One node invocation, run on its own task.
struct NodeTask {
    handler: Option<Arc<dyn OperationHandler>>,
    request: OperationRequest,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
    default_timeout_secs: u64,
}

impl NodeTask {
    /// Race the handler against timeout and cancellation.
    async fn run(self) -> NodeResult {
        let node_id = self.request.node_id.clone();
        let started = Instant::now();
        let result = if self.cancel.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            match self.handler {
                Some(handler) => {
                    Self::invoke(handler, self.request, &self.cancel, self.default_timeout_secs).await
                }
                None => Err(FlowError::HandlerNotFound(self.request.kind.to_string())),
            }
        };
        NodeResult {
            node_id,
            elapsed: started.elapsed(),
            result,
            permit: self.permit,
        }
    }

    async fn invoke(
        handler: Arc<dyn OperationHandler>,
        request: OperationRequest,
        cancel: &CancellationToken,
        default_timeout_secs: u64,
    ) -> Result<NodeOutput> {
        let node_id = request.node_id.clone();
        let timeout_secs = handler.timeout_secs().unwrap_or(default_timeout_secs);
        debug!(node_id = %node_id, handler = handler.name(), timeout_secs, "Invoking handler");

        let call = AssertUnwindSafe(async { handler.operate(request).await }).catch_unwind();
        tokio::select! {
            _ = cancel.cancelled() => Err(FlowError::Cancelled),
            outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), call) => match outcome {
                Err(_) => Err(FlowError::HandlerTimeout {
                    node: node_id.clone(),
                    timeout_secs,
                }),
                Ok(Err(panic)) => Err(FlowError::node(
                    &node_id,
                    format!("handler panicked: {}", panic_message(panic.as_ref())),
                )),
                Ok(Ok(result)) => result,
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
