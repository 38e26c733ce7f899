use thiserror::Error;

use crate::graph::GraphValidation;

#[derive(Debug, Error)]
pub enum FlowError {
    // Validation errors
    #[error("Invalid graph: {}", .0.summary())]
    InvalidGraph(GraphValidation),

    #[error("Invalid params for node {node}: {message}")]
    InvalidParams { node: String, message: String },

    // Node execution errors
    #[error("Node {node} failed: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Handler timeout after {timeout_secs}s: {node}")]
    HandlerTimeout { node: String, timeout_secs: u64 },

    #[error("No handler registered for node kind: {0}")]
    HandlerNotFound(String),

    #[error("Invalid status transition for node {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: String,
        to: String,
    },

    // Backend errors
    #[error("Backend request failed: {0}")]
    Backend(String),

    #[error("Backend job {job_id} not finished after {waited_secs}s")]
    BackendTimeout { job_id: String, waited_secs: u64 },

    // Infrastructure errors
    #[error("Run store error: {0}")]
    Store(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Event stream error: {0}")]
    Frame(String),

    #[error("Run task aborted: {0}")]
    Task(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Run cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Errors that are fatal to a whole run rather than scoped to one node.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::RunNotFound(_) | Self::Frame(_) | Self::Task(_) | Self::Io(_)
        )
    }

    /// Shorthand for a node-scoped failure.
    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
