//! Server-sent events and streamed tool-call deltas.

use super::{AssistantReply, LlmError};
use crate::conversation::ToolCall;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Splits a byte stream into SSE `data:` payloads.
///
/// Lines are buffered as bytes so a multi-byte character split across network
/// chunks is decoded whole.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    event_data: String,
}

impl SseParser {
    /// Feed bytes, returning every event completed by them.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.event_data.is_empty() {
                    events.push(std::mem::take(&mut self.event_data));
                }
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                if !self.event_data.is_empty() {
                    self.event_data.push('\n');
                }
                self.event_data.push_str(data.trim_start());
            }
            // `event:`, `id:`, `retry:` and `:` comments carry nothing we use.
        }

        events
    }

    /// Whatever event was still open when the stream ended.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let trailing = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
        if let Some(data) = trailing.trim_end().strip_prefix("data:") {
            if !self.event_data.is_empty() {
                self.event_data.push('\n');
            }
            self.event_data.push_str(data.trim_start());
        }
        let data = std::mem::take(&mut self.event_data);
        (!data.trim().is_empty()).then_some(data)
    }
}

#[derive(Deserialize, Default)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Default)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Default)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionCallDelta>,
}

#[derive(Deserialize, Default)]
struct StreamFunctionCallDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds streamed deltas into one [`AssistantReply`].
#[derive(Debug, Default)]
pub(crate) struct StreamAccumulator {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
}

impl StreamAccumulator {
    /// Apply one event payload. Returns true on the `[DONE]` terminator.
    pub(crate) fn apply(&mut self, payload: &str) -> Result<bool, LlmError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(false);
        }
        if payload == "[DONE]" {
            return Ok(true);
        }

        let chunk: StreamChunk = serde_json::from_str(payload)
            .map_err(|e| LlmError::Parse(format!("stream chunk: {e}")))?;
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                self.content.push_str(&text);
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let index = delta.index.unwrap_or(self.calls.len());
                let call = self.calls.entry(index).or_default();
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                        // Some servers resend the full name on every delta.
                        if call.name.is_empty() {
                            call.name = name;
                        } else if !call.name.ends_with(&name) {
                            call.name.push_str(&name);
                        }
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
        }
        Ok(false)
    }

    pub(crate) fn finish(self) -> AssistantReply {
        let content = (!self.content.is_empty()).then_some(self.content);
        let tool_calls = self
            .calls
            .into_values()
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            })
            .collect();
        AssistantReply::with_tool_calls(content, tool_calls)
    }
}
