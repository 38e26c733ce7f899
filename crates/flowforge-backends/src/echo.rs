use futures::future::BoxFuture;
use serde_json::Value;

use flowforge_core::error::Result;
use flowforge_core::graph::MediaFamily;
use flowforge_core::traits::OperationHandler;
use flowforge_core::types::{text_of, NodeOutput, OperationRequest};

/// Offline backend that answers immediately.
///
/// Text nodes get their prompt back; media nodes get an `echo://` URL naming
/// the run and node. Useful for trying graphs without a generation service.
pub struct EchoBackend {
    family: MediaFamily,
    model: Option<String>,
    name: String,
}

impl EchoBackend {
    pub fn new(family: MediaFamily, model: Option<String>) -> Self {
        Self {
            family,
            model,
            name: format!("echo-{}", family.as_str()),
        }
    }
}

/// Prompt for a request: the static param, else whatever arrived on the input ports.
pub(crate) fn prompt_of(request: &OperationRequest) -> String {
    if let Some(prompt) = request.params.prompt() {
        return prompt.to_string();
    }
    request
        .port_values()
        .into_iter()
        .map(|(_, value)| text_of(value))
        .collect::<Vec<_>>()
        .join("\n")
}

impl OperationHandler for EchoBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn operate(&self, request: OperationRequest) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            request.progress.report(0.0);
            let prompt = prompt_of(&request);
            let output = match self.family {
                MediaFamily::Text => NodeOutput::text(prompt.clone()),
                family => NodeOutput::media(
                    family.as_str(),
                    format!("echo://{}/{}/{}", family.as_str(), request.run_id, request.node_id),
                ),
            };
            request.progress.report(100.0);

            let mut output = output.with_metadata("prompt", Value::String(prompt));
            if let Some(model) = &self.model {
                output = output.with_metadata("model", Value::String(model.clone()));
            }
            Ok(output)
        })
    }
}
