//! Event framing: `event: <type>\ndata: <json>\n\n`.
//!
//! The `data:` line carries the event payload; the event type travels on the
//! `event:` line. [`FrameParser`] is the single decoder for the format and
//! accepts input split at arbitrary chunk boundaries.

use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::event::ProgressEvent;

/// Encode one event as a frame.
pub fn encode_frame(event: &ProgressEvent) -> Result<String> {
    let payload = match serde_json::to_value(event)? {
        Value::Object(mut obj) => obj.remove("payload").unwrap_or(Value::Null),
        _ => Value::Null,
    };
    Ok(format!(
        "event: {}\ndata: {}\n\n",
        event.event_type(),
        serde_json::to_string(&payload)?
    ))
}

/// Decode one frame block (without the trailing blank line).
pub fn decode_frame(block: &str) -> Result<ProgressEvent> {
    let mut event_type = None;
    let mut data_lines = Vec::new();

    for line in block.lines() {
        if let Some(val) = line.strip_prefix("event:") {
            event_type = Some(val.trim_start().to_string());
        } else if let Some(val) = line.strip_prefix("data:") {
            data_lines.push(val.strip_prefix(' ').unwrap_or(val));
        }
    }

    let event_type =
        event_type.ok_or_else(|| FlowError::Frame(format!("missing event line in {:?}", block)))?;
    if data_lines.is_empty() {
        return Err(FlowError::Frame(format!(
            "missing data line for '{}' event",
            event_type
        )));
    }

    let payload: Value = serde_json::from_str(&data_lines.join("\n"))
        .map_err(|e| FlowError::Frame(format!("bad '{}' payload: {}", event_type, e)))?;
    serde_json::from_value(serde_json::json!({
        "type": event_type,
        "payload": payload,
    }))
    .map_err(|e| FlowError::Frame(format!("unknown or malformed '{}' event: {}", event_type, e)))
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<Result<ProgressEvent>> {
        self.buffer.push_str(&chunk.replace('\r', ""));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            let block = block.trim_end_matches('\n');
            if block.trim().is_empty() {
                continue;
            }
            events.push(decode_frame(block));
        }

        events
    }

    /// Bytes received but not yet forming a complete frame.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}
