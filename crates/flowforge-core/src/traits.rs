use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::graph::GraphSubmission;
use crate::types::*;

/// Durable record of runs and their node transitions.
pub trait RunStore: Send + Sync + 'static {
    /// Persist a new run record.
    fn create_run(&self, run: &Run) -> BoxFuture<'_, Result<()>>;

    /// Apply a partial update to a run. Unknown ids are an error.
    fn update_run(&self, run_id: &RunId, update: RunUpdate) -> BoxFuture<'_, Result<()>>;

    /// Append one node transition to the run's event log.
    fn append_run_event(
        &self,
        run_id: &RunId,
        node_id: &str,
        status: NodeStatus,
        payload: Value,
    ) -> BoxFuture<'_, Result<()>>;

    /// Load a run record.
    fn get_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>>;

    /// All events of a run in append order.
    fn run_events(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<RunEvent>>>;
}

/// Last saved graph per project.
pub trait GraphStore: Send + Sync + 'static {
    fn save_graph(&self, submission: &GraphSubmission) -> BoxFuture<'_, Result<()>>;

    fn load_graph(&self, project_id: &str) -> BoxFuture<'_, Result<Option<GraphSubmission>>>;
}

/// Computes one node's output from its assembled inputs.
pub trait OperationHandler: Send + Sync + 'static {
    /// Handler name, for logs.
    fn name(&self) -> &str;

    /// Run the operation.
    fn operate(&self, request: OperationRequest) -> BoxFuture<'_, Result<NodeOutput>>;

    /// Per-call timeout override in seconds. `None` uses the engine default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}
