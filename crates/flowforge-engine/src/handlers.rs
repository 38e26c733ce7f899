use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use flowforge_core::error::{FlowError, Result};
use flowforge_core::graph::{CombineStrategy, NodeKind, NodeParams, TransformOp};
use flowforge_core::traits::OperationHandler;
use flowforge_core::types::{text_of, NodeOutput, OperationRequest};

/// Maps node kinds to the handler that computes them.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeKind, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the locally computed kinds registered.
    pub fn with_local_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(NodeKind::Input, InputHandler);
        registry.register(NodeKind::Transform, TransformHandler);
        registry.register(NodeKind::Combine, CombineHandler);
        registry.register(NodeKind::Output, OutputHandler);
        registry
    }

    /// Register a handler, replacing any previous one for the kind.
    pub fn register(&mut self, kind: NodeKind, handler: impl OperationHandler) {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn register_arc(&mut self, kind: NodeKind, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut kinds: Vec<NodeKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Interpret an input value as a node output: strings become text.
fn output_of(value: &Value) -> NodeOutput {
    match value {
        Value::String(s) => NodeOutput::text(s.clone()),
        other => NodeOutput::from_value(other),
    }
}

/// First value present on the node's input ports.
fn first_input(request: &OperationRequest) -> Value {
    request
        .port_values()
        .first()
        .map(|(_, v)| (*v).clone())
        .unwrap_or(Value::Null)
}

// ── input ───────────────────────────────────────────────────────

/// Emits the node's static value.
pub struct InputHandler;

impl OperationHandler for InputHandler {
    fn name(&self) -> &str {
        "input"
    }

    fn operate(&self, request: OperationRequest) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let (value, output_type) = match &request.params {
                NodeParams::Input(p) => (p.value.clone(), p.output_type.clone()),
                _ => (None, None),
            };
            let value = value
                .or_else(|| request.inputs.get("value").cloned())
                .unwrap_or(Value::Null);

            let mut output = output_of(&value);
            if let Some(output_type) = output_type {
                let is_media = ["image", "video", "audio"]
                    .iter()
                    .any(|c| output_type.split('/').next() == Some(*c));
                match value {
                    Value::String(url) if is_media => {
                        output = NodeOutput::media(output_type, url);
                    }
                    _ => output.output_type = output_type,
                }
            }
            Ok(output)
        })
    }
}

// ── transform ───────────────────────────────────────────────────

/// Applies a [`TransformOp`] to its input.
pub struct TransformHandler;

impl OperationHandler for TransformHandler {
    fn name(&self) -> &str {
        "transform"
    }

    fn operate(&self, request: OperationRequest) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let op = match &request.params {
                NodeParams::Transform(op) => op.clone(),
                _ => TransformOp::Passthrough,
            };
            let value = first_input(&request);

            let output = match op {
                TransformOp::Passthrough => output_of(&value),
                TransformOp::Template { template } => {
                    NodeOutput::text(render_template(&template, &request))
                }
                TransformOp::Uppercase => NodeOutput::text(text_of(&value).to_uppercase()),
                TransformOp::Lowercase => NodeOutput::text(text_of(&value).to_lowercase()),
                TransformOp::Trim => NodeOutput::text(text_of(&value).trim()),
                TransformOp::Extract { field } => {
                    let source = match &value {
                        Value::Object(obj) if obj.contains_key("type") => {
                            obj.get("data").cloned().unwrap_or(Value::Null)
                        }
                        other => other.clone(),
                    };
                    let source = match source {
                        // Text outputs often carry JSON documents.
                        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                        other => other,
                    };
                    let found = extract_path(&source, &field).ok_or_else(|| {
                        FlowError::node(&request.node_id, format!("field '{}' not found", field))
                    })?;
                    output_of(found)
                }
            };
            Ok(output)
        })
    }
}

/// Replace `{{name}}` with the text of input `name`. Unknown names are kept.
fn render_template(template: &str, request: &OperationRequest) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match request.inputs.get(key) {
                    Some(value) => rendered.push_str(&text_of(value)),
                    None => rendered.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                rendered.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

/// Follow a dotted path (`a.b.0.c`) through objects and arrays.
fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(obj) => obj.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// ── combine ─────────────────────────────────────────────────────

/// Merges every input into one output.
pub struct CombineHandler;

impl OperationHandler for CombineHandler {
    fn name(&self) -> &str {
        "combine"
    }

    fn operate(&self, request: OperationRequest) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let (strategy, separator) = match &request.params {
                NodeParams::Combine(p) => (
                    p.strategy,
                    p.separator.clone().unwrap_or_else(|| "\n".to_string()),
                ),
                _ => (CombineStrategy::List, "\n".to_string()),
            };
            let ports = request.port_values();

            let output = match strategy {
                CombineStrategy::Object => {
                    let merged: Map<String, Value> = ports
                        .iter()
                        .map(|(name, value)| (name.to_string(), (*value).clone()))
                        .collect();
                    NodeOutput::json(Value::Object(merged))
                }
                CombineStrategy::List | CombineStrategy::Concat => {
                    let items: Vec<Value> = ports
                        .iter()
                        .flat_map(|(_, value)| match value {
                            Value::Array(many) => many.clone(),
                            one => vec![(*one).clone()],
                        })
                        .collect();
                    if strategy == CombineStrategy::Concat {
                        let parts: Vec<String> = items.iter().map(text_of).collect();
                        NodeOutput::text(parts.join(&separator))
                    } else {
                        NodeOutput::json(Value::Array(items))
                    }
                }
            };
            Ok(output.with_metadata("inputs", Value::from(ports.len())))
        })
    }
}

// ── output ──────────────────────────────────────────────────────

/// Terminal sink: passes its input through, tagged with the output name.
pub struct OutputHandler;

impl OperationHandler for OutputHandler {
    fn name(&self) -> &str {
        "output"
    }

    fn operate(&self, request: OperationRequest) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let mut output = output_of(&first_input(&request));
            if let NodeParams::Output(p) = &request.params {
                if let Some(name) = &p.name {
                    output = output.with_metadata("name", Value::String(name.clone()));
                }
            }
            Ok(output)
        })
    }
}
