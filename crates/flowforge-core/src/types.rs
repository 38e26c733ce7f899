use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::event::ProgressReporter;
use crate::graph::{NodeKind, NodeParams};

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-node status within one run.
///
/// Moves forward only: `idle/queued -> running -> terminal`. Skipping and
/// cancellation may also happen straight from `idle`/`queued`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Canceled
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        match self {
            Self::Idle => matches!(
                next,
                Self::Queued | Self::Running | Self::Skipped | Self::Canceled
            ),
            Self::Queued => matches!(next, Self::Running | Self::Skipped | Self::Canceled),
            Self::Running => matches!(next, Self::Succeeded | Self::Failed | Self::Canceled),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "idle" => Self::Idle,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            "canceled" => Self::Canceled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a whole run.
///
/// `Completed` describes the lifecycle only; individual nodes may have
/// failed or been skipped.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent record of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub project_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub execution_order: Vec<String>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Partial update applied by `RunStore::update_run`. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub execution_order: Option<Vec<String>>,
    pub total_nodes: Option<usize>,
    pub completed_nodes: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn completed_nodes(count: usize) -> Self {
        Self {
            completed_nodes: Some(count),
            ..Self::default()
        }
    }

    /// Terminal update: status plus `finished_at = now`.
    pub fn finished(status: RunStatus, error: Option<String>) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(Utc::now()),
            error,
            ..Self::default()
        }
    }
}

/// Append-only record of a node status transition within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: RunId,
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Result produced by an operation handler: `{type, url|data, metadata}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    #[serde(rename = "type")]
    pub output_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl NodeOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            output_type: "text".to_string(),
            url: None,
            data: Some(Value::String(text.into())),
            metadata: Map::new(),
        }
    }

    pub fn json(value: Value) -> Self {
        Self {
            output_type: "json".to_string(),
            url: None,
            data: Some(value),
            metadata: Map::new(),
        }
    }

    pub fn media(output_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            output_type: output_type.into(),
            url: Some(url.into()),
            data: None,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Interpret an arbitrary input value as an output, wrapping non-outputs as JSON.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value::<NodeOutput>(value.clone())
            .unwrap_or_else(|_| Self::json(value.clone()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Best-effort text rendering of an input value.
///
/// Strings pass through, node outputs yield their text data or URL, arrays
/// are joined line by line.
pub fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(text_of).collect::<Vec<_>>().join("\n"),
        Value::Object(obj) => match (obj.get("data"), obj.get("url")) {
            (Some(Value::String(s)), _) => s.clone(),
            (Some(data), _) if !data.is_null() => data.to_string(),
            (_, Some(Value::String(url))) => url.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Everything an operation handler receives for one node invocation.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub run_id: RunId,
    pub node_id: String,
    pub kind: NodeKind,
    /// Static params merged with upstream values keyed by input port name.
    pub inputs: Map<String, Value>,
    /// Input port names in declaration order.
    pub ports: Vec<String>,
    pub params: NodeParams,
    pub progress: ProgressReporter,
}

impl OperationRequest {
    /// Values supplied on this node's input ports, in port order.
    pub fn port_values(&self) -> Vec<(&str, &Value)> {
        self.ports
            .iter()
            .filter_map(|p| self.inputs.get(p).map(|v| (p.as_str(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_status_forward_only() {
        assert!(NodeStatus::Queued.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Queued.can_transition_to(NodeStatus::Skipped));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Failed));
        assert!(!NodeStatus::Running.can_transition_to(NodeStatus::Queued));
        assert!(!NodeStatus::Running.can_transition_to(NodeStatus::Skipped));
        for terminal in [
            NodeStatus::Succeeded,
            NodeStatus::Failed,
            NodeStatus::Skipped,
            NodeStatus::Canceled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(NodeStatus::Running));
            assert!(!terminal.can_transition_to(NodeStatus::Succeeded));
        }
    }

    #[test]
    fn test_status_string_forms() {
        assert_eq!(NodeStatus::parse("skipped"), Some(NodeStatus::Skipped));
        assert_eq!(RunStatus::parse("canceled"), Some(RunStatus::Canceled));
        assert_eq!(RunStatus::parse("bogus"), None);
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_node_output_wire_shape() {
        let out = NodeOutput::media("image", "https://cdn/x.png").with_metadata("w", json!(512));
        let v = out.to_value();
        assert_eq!(v["type"], "image");
        assert_eq!(v["url"], "https://cdn/x.png");
        assert_eq!(v["metadata"]["w"], 512);
        assert!(v.get("data").is_none());
        assert_eq!(NodeOutput::from_value(&v), out);
    }

    #[test]
    fn test_from_value_wraps_plain_json() {
        let out = NodeOutput::from_value(&json!([1, 2]));
        assert_eq!(out.output_type, "json");
        assert_eq!(out.data, Some(json!([1, 2])));
    }

    #[test]
    fn test_text_of() {
        assert_eq!(text_of(&json!("hi")), "hi");
        assert_eq!(text_of(&NodeOutput::text("a cat").to_value()), "a cat");
        assert_eq!(text_of(&NodeOutput::media("image", "u://1").to_value()), "u://1");
        assert_eq!(text_of(&json!(["a", "b"])), "a\nb");
        assert_eq!(text_of(&json!(3)), "3");
    }
}
