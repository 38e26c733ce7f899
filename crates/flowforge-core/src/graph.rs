//! Graph model: nodes, typed ports, edges, and per-kind params.
//!
//! These are plain data definitions shared by validation, scheduling, and
//! execution. Nothing here mutates during a run; per-run node state lives in
//! the engine's run context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FlowError;

/// Universal data type accepted by and assignable to every port.
pub const ANY_TYPE: &str = "any";

fn any_type() -> String {
    ANY_TYPE.to_string()
}

/// Port direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

/// Allowed number of edges touching a port. `max = None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cardinality {
    #[serde(default)]
    pub min: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl Cardinality {
    pub fn single() -> Self {
        Self {
            min: 0,
            max: Some(1),
        }
    }

    pub fn at_most(max: u32) -> Self {
        Self {
            min: 0,
            max: Some(max),
        }
    }

    pub fn unbounded() -> Self {
        Self { min: 0, max: None }
    }

    /// Whether a port already holding `existing` edges may take one more.
    pub fn has_room(&self, existing: usize) -> bool {
        self.max.map_or(true, |max| existing < max as usize)
    }

    /// Ports that may hold several edges receive their upstream values as a list.
    pub fn accepts_many(&self) -> bool {
        self.max != Some(1)
    }
}

/// A typed input or output slot on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub id: String,
    pub name: String,
    pub data_type: String,
    pub direction: PortDirection,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub optional: bool,
}

impl Port {
    pub fn input(id: impl Into<String>, data_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            data_type: data_type.into(),
            direction: PortDirection::Input,
            cardinality: Cardinality::single(),
            optional: false,
        }
    }

    pub fn output(id: impl Into<String>, data_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            data_type: data_type.into(),
            direction: PortDirection::Output,
            cardinality: Cardinality::unbounded(),
            optional: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }
}

/// Port as submitted by a client; direction and cardinality may be omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortDefinition {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "any_type")]
    data_type: String,
    #[serde(default)]
    direction: Option<PortDirection>,
    #[serde(default)]
    cardinality: Option<Cardinality>,
    #[serde(default)]
    optional: bool,
}

impl PortDefinition {
    fn into_port(self, node_id: &str, listed_as: PortDirection) -> Result<Port, FlowError> {
        if let Some(declared) = self.direction {
            if declared != listed_as {
                return Err(FlowError::InvalidParams {
                    node: node_id.to_string(),
                    message: format!(
                        "port '{}' declared as {:?} but listed among {:?} ports",
                        self.id, declared, listed_as
                    ),
                });
            }
        }
        let cardinality = self.cardinality.unwrap_or(match listed_as {
            PortDirection::Input => Cardinality::single(),
            PortDirection::Output => Cardinality::unbounded(),
        });
        Ok(Port {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            data_type: self.data_type,
            direction: listed_as,
            cardinality,
            optional: self.optional,
        })
    }
}

/// Output family served by a generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFamily {
    Text,
    Image,
    Video,
    Audio,
}

impl MediaFamily {
    pub const ALL: [MediaFamily; 4] = [Self::Text, Self::Image, Self::Video, Self::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Text => NodeKind::GenerateText,
            Self::Image => NodeKind::GenerateImage,
            Self::Video => NodeKind::GenerateVideo,
            Self::Audio => NodeKind::GenerateAudio,
        }
    }
}

/// Operation performed by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Input,
    GenerateText,
    GenerateImage,
    GenerateVideo,
    GenerateAudio,
    Transform,
    Combine,
    Output,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::GenerateText => "generate-text",
            Self::GenerateImage => "generate-image",
            Self::GenerateVideo => "generate-video",
            Self::GenerateAudio => "generate-audio",
            Self::Transform => "transform",
            Self::Combine => "combine",
            Self::Output => "output",
        }
    }

    /// Backend family for generation kinds; `None` for locally computed kinds.
    pub fn family(&self) -> Option<MediaFamily> {
        match self {
            Self::GenerateText => Some(MediaFamily::Text),
            Self::GenerateImage => Some(MediaFamily::Image),
            Self::GenerateVideo => Some(MediaFamily::Video),
            Self::GenerateAudio => Some(MediaFamily::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Typed params ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Output type to report; inferred from the value when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f32>,
}

/// Operation applied by a `transform` node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum TransformOp {
    #[default]
    Passthrough,
    /// Replace `{{port}}` placeholders with the text of each input port.
    Template { template: String },
    Uppercase,
    Lowercase,
    Trim,
    /// Pull a (dotted) field out of the first input's JSON data.
    Extract { field: String },
}

/// How a `combine` node merges its inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineStrategy {
    #[default]
    List,
    Object,
    Concat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombineParams {
    #[serde(default)]
    pub strategy: CombineStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Params for a node, one typed shape per kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NodeParams {
    Input(InputParams),
    GenerateText(TextParams),
    GenerateImage(ImageParams),
    GenerateVideo(VideoParams),
    GenerateAudio(AudioParams),
    Transform(TransformOp),
    Combine(CombineParams),
    Output(OutputParams),
}

impl NodeParams {
    /// Default params for a kind.
    pub fn default_for(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Input => Self::Input(InputParams::default()),
            NodeKind::GenerateText => Self::GenerateText(TextParams::default()),
            NodeKind::GenerateImage => Self::GenerateImage(ImageParams::default()),
            NodeKind::GenerateVideo => Self::GenerateVideo(VideoParams::default()),
            NodeKind::GenerateAudio => Self::GenerateAudio(AudioParams::default()),
            NodeKind::Transform => Self::Transform(TransformOp::default()),
            NodeKind::Combine => Self::Combine(CombineParams::default()),
            NodeKind::Output => Self::Output(OutputParams::default()),
        }
    }

    /// Parse and validate an open params map into the shape for `kind`.
    pub fn parse(kind: NodeKind, mut params: Map<String, Value>) -> Result<Self, String> {
        if kind == NodeKind::Transform && !params.contains_key("operation") {
            params.insert("operation".into(), Value::String("passthrough".into()));
        }
        let value = Value::Object(params);
        let parsed = match kind {
            NodeKind::Input => serde_json::from_value(value).map(Self::Input),
            NodeKind::GenerateText => serde_json::from_value(value).map(Self::GenerateText),
            NodeKind::GenerateImage => serde_json::from_value(value).map(Self::GenerateImage),
            NodeKind::GenerateVideo => serde_json::from_value(value).map(Self::GenerateVideo),
            NodeKind::GenerateAudio => serde_json::from_value(value).map(Self::GenerateAudio),
            NodeKind::Transform => serde_json::from_value(value).map(Self::Transform),
            NodeKind::Combine => serde_json::from_value(value).map(Self::Combine),
            NodeKind::Output => serde_json::from_value(value).map(Self::Output),
        }
        .map_err(|e| e.to_string())?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::GenerateText(p) => {
                if let Some(t) = p.temperature {
                    if !(0.0..=2.0).contains(&t) {
                        return Err(format!("temperature {} outside 0.0..=2.0", t));
                    }
                }
                if p.max_tokens == Some(0) {
                    return Err("maxTokens must be positive".into());
                }
            }
            Self::GenerateImage(p) => {
                for (name, dim) in [("width", p.width), ("height", p.height)] {
                    if let Some(d) = dim {
                        if d == 0 || d > 8192 {
                            return Err(format!("{} {} outside 1..=8192", name, d));
                        }
                    }
                }
            }
            Self::GenerateVideo(VideoParams {
                duration_secs: Some(d),
                ..
            })
            | Self::GenerateAudio(AudioParams {
                duration_secs: Some(d),
                ..
            }) => {
                if *d <= 0.0 || *d > 600.0 {
                    return Err(format!("durationSecs {} outside (0, 600]", d));
                }
            }
            Self::Transform(TransformOp::Extract { field }) if field.is_empty() => {
                return Err("extract requires a non-empty field".into());
            }
            _ => {}
        }
        Ok(())
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Input(_) => NodeKind::Input,
            Self::GenerateText(_) => NodeKind::GenerateText,
            Self::GenerateImage(_) => NodeKind::GenerateImage,
            Self::GenerateVideo(_) => NodeKind::GenerateVideo,
            Self::GenerateAudio(_) => NodeKind::GenerateAudio,
            Self::Transform(_) => NodeKind::Transform,
            Self::Combine(_) => NodeKind::Combine,
            Self::Output(_) => NodeKind::Output,
        }
    }

    /// Static prompt, for generation kinds that have one.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::GenerateText(p) => p.prompt.as_deref(),
            Self::GenerateImage(p) => p.prompt.as_deref(),
            Self::GenerateVideo(p) => p.prompt.as_deref(),
            Self::GenerateAudio(p) => p.prompt.as_deref(),
            _ => None,
        }
    }

    /// Params as a flat map, the base layer of a node's input map.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

// ── Nodes and edges ─────────────────────────────────────────────

/// Node as submitted by a client. Visual metadata is accepted and dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeDefinition {
    id: String,
    kind: NodeKind,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    inputs: Vec<PortDefinition>,
    #[serde(default)]
    outputs: Vec<PortDefinition>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    #[allow(dead_code)]
    position: Option<Value>,
}

/// One compute operation in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "NodeDefinition")]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub params: NodeParams,
}

impl TryFrom<NodeDefinition> for Node {
    type Error = FlowError;

    fn try_from(def: NodeDefinition) -> Result<Self, Self::Error> {
        let params = NodeParams::parse(def.kind, def.params).map_err(|message| {
            FlowError::InvalidParams {
                node: def.id.clone(),
                message,
            }
        })?;
        let inputs = def
            .inputs
            .into_iter()
            .map(|p| p.into_port(&def.id, PortDirection::Input))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = def
            .outputs
            .into_iter()
            .map(|p| p.into_port(&def.id, PortDirection::Output))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            label: def.label.unwrap_or_else(|| def.id.clone()),
            id: def.id,
            kind: def.kind,
            inputs,
            outputs,
            params,
        })
    }
}

impl Node {
    /// Create a node with default params and no ports.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            inputs: vec![],
            outputs: vec![],
            params: NodeParams::default_for(kind),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_input(mut self, port: Port) -> Self {
        self.inputs.push(Port {
            direction: PortDirection::Input,
            ..port
        });
        self
    }

    pub fn with_output(mut self, port: Port) -> Self {
        self.outputs.push(Port {
            direction: PortDirection::Output,
            ..port
        });
        self
    }

    /// Replace params; they must match the node's kind.
    pub fn with_params(mut self, params: NodeParams) -> Self {
        debug_assert_eq!(params.kind(), self.kind);
        self.params = params;
        self
    }

    pub fn input_port(&self, port_id: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.id == port_id)
    }

    pub fn output_port(&self, port_id: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.id == port_id)
    }

    /// Input ports that must have at least one inbound edge.
    pub fn required_inputs(&self) -> impl Iterator<Item = &Port> {
        self.inputs.iter().filter(|p| !p.optional)
    }
}

/// A typed connection from one output port to one input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source_node_id: String,
    pub source_port_id: String,
    pub target_node_id: String,
    pub target_port_id: String,
    #[serde(default = "any_type")]
    pub data_type: String,
}

impl Edge {
    /// Create an edge carrying the universal `any` type.
    pub fn new(
        id: impl Into<String>,
        source: (&str, &str),
        target: (&str, &str),
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.0.to_string(),
            source_port_id: source.1.to_string(),
            target_node_id: target.0.to_string(),
            target_port_id: target.1.to_string(),
            data_type: any_type(),
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = data_type.into();
        self
    }

    /// Whether this edge ends on the given input port.
    pub fn targets(&self, node_id: &str, port_id: &str) -> bool {
        self.target_node_id == node_id && self.target_port_id == port_id
    }

    /// Whether this edge starts on the given output port.
    pub fn sources(&self, node_id: &str, port_id: &str) -> bool {
        self.source_node_id == node_id && self.source_port_id == port_id
    }
}

/// `{projectId, nodes, edges}` as submitted for validation or execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSubmission {
    pub project_id: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Indexed, read-only view over a node/edge set.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// Node id → position in `nodes` (insertion order).
    index: HashMap<String, usize>,
    /// Edges indexed by target node.
    incoming: HashMap<String, Vec<usize>>,
    /// Edges indexed by source node.
    outgoing: HashMap<String, Vec<usize>>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            index.entry(node.id.clone()).or_insert(i);
        }
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            incoming.entry(edge.target_node_id.clone()).or_default().push(i);
            outgoing.entry(edge.source_node_id.clone()).or_default().push(i);
        }
        Self {
            nodes,
            edges,
            index,
            incoming,
            outgoing,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Position of a node in insertion order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a port on a node, in either direction.
    pub fn port(&self, node_id: &str, port_id: &str) -> Option<&Port> {
        let node = self.node(node_id)?;
        node.input_port(port_id).or_else(|| node.output_port(port_id))
    }

    /// Edges ending at `node_id`, in submission order.
    pub fn incoming(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(node_id)
            .into_iter()
            .flat_map(|indices| indices.iter().map(|&i| &self.edges[i]))
    }

    /// Edges starting at `node_id`, in submission order.
    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(node_id)
            .into_iter()
            .flat_map(|indices| indices.iter().map(|&i| &self.edges[i]))
    }

    /// Direct upstream node ids of `node_id`.
    pub fn upstream(&self, node_id: &str) -> impl Iterator<Item = &str> {
        self.incoming(node_id).map(|e| e.source_node_id.as_str())
    }
}

impl From<GraphSubmission> for Graph {
    fn from(submission: GraphSubmission) -> Self {
        Self::new(submission.nodes, submission.edges)
    }
}

// ── Validation report ───────────────────────────────────────────

/// Category of a graph validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    DuplicateNode,
    UnknownNode,
    InvalidPort,
    TypeMismatch,
    Cardinality,
    Cycle,
    SelfConnection,
    MissingInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub message: String,
}

/// Result of whole-graph validation: `{valid, errors[]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphValidation {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl GraphValidation {
    pub fn from_errors(errors: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// One-line description for logs and error messages.
    pub fn summary(&self) -> String {
        match self.errors.first() {
            None => "no errors".to_string(),
            Some(first) if self.errors.len() == 1 => first.message.clone(),
            Some(first) => format!("{} (and {} more)", first.message, self.errors.len() - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_from_client_json() {
        let node: Node = serde_json::from_value(json!({
            "id": "img",
            "kind": "generate-image",
            "label": "Poster",
            "position": {"x": 10, "y": 20},
            "inputs": [{"id": "prompt", "dataType": "text/plain"}],
            "outputs": [{"id": "image", "dataType": "image/png"}],
            "params": {"prompt": "a lighthouse", "width": 768}
        }))
        .unwrap();

        assert_eq!(node.kind, NodeKind::GenerateImage);
        assert_eq!(node.label, "Poster");
        let prompt = node.input_port("prompt").unwrap();
        assert_eq!(prompt.direction, PortDirection::Input);
        assert_eq!(prompt.cardinality, Cardinality::single());
        assert_eq!(prompt.name, "prompt");
        let image = node.output_port("image").unwrap();
        assert_eq!(image.cardinality.max, None);
        match &node.params {
            NodeParams::GenerateImage(p) => {
                assert_eq!(p.prompt.as_deref(), Some("a lighthouse"));
                assert_eq!(p.width, Some(768));
            }
            other => panic!("unexpected params: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_params_rejected_at_construction() {
        let err = serde_json::from_value::<Node>(json!({
            "id": "t",
            "kind": "generate-text",
            "params": {"temperature": 7.5}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("temperature"));

        let err = serde_json::from_value::<Node>(json!({
            "id": "i",
            "kind": "generate-image",
            "params": {"width": "wide"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Invalid params"));
    }

    #[test]
    fn test_misplaced_port_direction_rejected() {
        let err = serde_json::from_value::<Node>(json!({
            "id": "n",
            "kind": "output",
            "inputs": [{"id": "x", "direction": "output"}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("listed among"));
    }

    #[test]
    fn test_transform_defaults_to_passthrough() {
        let params = NodeParams::parse(NodeKind::Transform, Map::new()).unwrap();
        assert_eq!(params, NodeParams::Transform(TransformOp::Passthrough));

        let mut map = Map::new();
        map.insert("operation".into(), json!("template"));
        map.insert("template".into(), json!("Hello {{name}}"));
        let params = NodeParams::parse(NodeKind::Transform, map).unwrap();
        assert_eq!(
            params,
            NodeParams::Transform(TransformOp::Template {
                template: "Hello {{name}}".into()
            })
        );
    }

    #[test]
    fn test_params_to_map_skips_unset() {
        let params = NodeParams::GenerateText(TextParams {
            prompt: Some("hi".into()),
            ..Default::default()
        });
        let map = params.to_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map["prompt"], "hi");
        assert_eq!(params.prompt(), Some("hi"));
    }

    #[test]
    fn test_node_serialization_roundtrip() {
        let node = Node::new("c", NodeKind::Combine)
            .with_input(Port::input("parts", "any").with_cardinality(Cardinality::at_most(2)))
            .with_output(Port::output("out", "any"))
            .with_params(NodeParams::Combine(CombineParams {
                strategy: CombineStrategy::Concat,
                separator: Some(", ".into()),
            }));
        let json = serde_json::to_string(&node).unwrap();
        let parsed: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_graph_lookups() {
        let graph = Graph::new(
            vec![
                Node::new("a", NodeKind::Input).with_output(Port::output("out", "text/plain")),
                Node::new("b", NodeKind::Output).with_input(Port::input("in", "any")),
            ],
            vec![Edge::new("e1", ("a", "out"), ("b", "in"))],
        );
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.position("b"), Some(1));
        assert_eq!(graph.incoming("b").count(), 1);
        assert_eq!(graph.outgoing("a").count(), 1);
        assert_eq!(graph.upstream("b").collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(graph.port("a", "out").unwrap().data_type, "text/plain");
        assert!(graph.port("a", "missing").is_none());
        assert!(graph.incoming("a").next().is_none());
    }

    #[test]
    fn test_edge_data_type_defaults_to_any() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e",
            "sourceNodeId": "a",
            "sourcePortId": "out",
            "targetNodeId": "b",
            "targetPortId": "in"
        }))
        .unwrap();
        assert_eq!(edge.data_type, ANY_TYPE);
        assert!(edge.targets("b", "in"));
        assert!(edge.sources("a", "out"));
    }

    #[test]
    fn test_cardinality_room() {
        assert!(Cardinality::single().has_room(0));
        assert!(!Cardinality::single().has_room(1));
        assert!(Cardinality::unbounded().has_room(10_000));
        assert!(!Cardinality::single().accepts_many());
        assert!(Cardinality::at_most(2).accepts_many());
    }
}
