use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::streaming::decoder::Frame;

/// Typed event produced from one backend frame, consumed exactly once by
/// a dialect encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ToolUseStart {
        id: String,
        name: String,
    },
    /// Carries the fragment from this frame only, never the accumulated
    /// string; fragment-level forwarding keeps the stream low-latency.
    ToolUseDelta {
        id: String,
        fragment: String,
    },
    ToolUseStop {
        id: String,
    },
    MessageStop {
        stop_reason: String,
    },
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    /// Unrecognized-but-benign backend events are forwarded, not dropped.
    Passthrough {
        event_type: String,
        payload: Value,
    },
}

/// Accumulates the argument fragments of one in-flight tool call.
#[derive(Debug, Clone)]
struct ToolAccumulator {
    id: String,
    name: String,
    fragments: Vec<String>,
}

impl ToolAccumulator {
    fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            fragments: Vec::new(),
        }
    }

    fn concatenated(&self) -> String {
        self.fragments.concat()
    }
}

/// A tool call left open when the stream ended.
#[derive(Debug, Clone)]
pub struct IncompleteToolCall {
    pub id: String,
    pub name: String,
    pub partial_arguments: String,
}

/// Maps decoded frames to [`StreamEvent`]s, reconstructing tool-call
/// arguments that arrive split across many frames. State is per-request.
pub struct EventTranslator {
    tool: Option<ToolAccumulator>,
    input_tokens: u32,
    output_tokens: u32,
    usage_final: bool,
    stopped: bool,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self {
            tool: None,
            input_tokens: 0,
            output_tokens: 0,
            usage_final: false,
            stopped: false,
        }
    }

    /// Translate one frame into zero or more events, in frame order.
    pub fn translate(&mut self, frame: &Frame) -> Result<Vec<StreamEvent>> {
        let event_type = frame.event_type().ok_or_else(|| {
            GatewayError::FrameCorruption("frame carries no event-type header".into())
        })?;

        let payload: Value = if frame.payload.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(&frame.payload).map_err(|e| {
                GatewayError::FrameCorruption(format!("{event_type} payload is not JSON: {e}"))
            })?
        };

        let events = match event_type {
            "assistantResponseEvent" => self.translate_text(&payload),
            "toolUseEvent" => self.translate_tool_use(&payload),
            "messageStopEvent" => self.translate_stop(&payload),
            "messageMetadataEvent" => self.translate_usage(&payload),
            other => vec![StreamEvent::Passthrough {
                event_type: other.to_string(),
                payload,
            }],
        };

        Ok(events)
    }

    /// Running usage totals; only final once message stop was observed.
    pub fn usage(&self) -> (u32, u32) {
        (self.input_tokens, self.output_tokens)
    }

    pub fn usage_is_final(&self) -> bool {
        self.usage_final
    }

    /// Whether a message stop has been observed.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Close out the translator at end of stream. A tool call still open
    /// here means the backend hung up mid-call; the partial arguments are
    /// surfaced instead of silently dropped.
    pub fn finish(&mut self) -> Option<IncompleteToolCall> {
        self.tool.take().map(|acc| IncompleteToolCall {
            partial_arguments: acc.concatenated(),
            id: acc.id,
            name: acc.name,
        })
    }

    fn translate_text(&mut self, payload: &Value) -> Vec<StreamEvent> {
        match payload.get("content").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => vec![StreamEvent::TextDelta {
                text: text.to_string(),
            }],
            _ => Vec::new(),
        }
    }

    /// Tool frames are disambiguated by field presence: a `stop` flag
    /// closes the call, an `input` field is an argument fragment (deltas
    /// may also repeat name/toolUseId, so this check comes first), and a
    /// bare name/toolUseId pair opens the call.
    fn translate_tool_use(&mut self, payload: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if payload.get("stop").and_then(Value::as_bool).unwrap_or(false) {
            if let Some(acc) = self.tool.take() {
                events.push(StreamEvent::ToolUseStop { id: acc.id });
            } else {
                tracing::warn!("tool stop without an open tool call");
            }
            return events;
        }

        if let Some(fragment) = payload.get("input").and_then(Value::as_str) {
            if self.tool.is_none() {
                if let Some(start) = self.open_tool(payload) {
                    events.push(start);
                } else {
                    tracing::warn!("tool input fragment without an open tool call");
                    return events;
                }
            }

            let acc = self.tool.as_mut().expect("tool accumulator open");
            acc.fragments.push(fragment.to_string());
            events.push(StreamEvent::ToolUseDelta {
                id: acc.id.clone(),
                fragment: fragment.to_string(),
            });
            return events;
        }

        if self.tool.is_none()
            && let Some(start) = self.open_tool(payload)
        {
            events.push(start);
        }

        events
    }

    fn open_tool(&mut self, payload: &Value) -> Option<StreamEvent> {
        let name = payload.get("name").and_then(Value::as_str)?;
        let id = payload.get("toolUseId").and_then(Value::as_str)?;

        tracing::debug!(tool_use_id = %id, tool_name = %name, "opening tool call");
        self.tool = Some(ToolAccumulator::new(id.to_string(), name.to_string()));
        Some(StreamEvent::ToolUseStart {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    fn translate_stop(&mut self, payload: &Value) -> Vec<StreamEvent> {
        let stop_reason = payload
            .get("stopReason")
            .and_then(Value::as_str)
            .unwrap_or("end_turn")
            .to_string();

        self.stopped = true;
        self.usage_final = true;

        let mut events = Vec::new();
        // A stop that arrives while a tool call is open implicitly closes it.
        if let Some(acc) = self.tool.take() {
            events.push(StreamEvent::ToolUseStop { id: acc.id });
        }
        events.push(StreamEvent::MessageStop { stop_reason });
        events
    }

    fn translate_usage(&mut self, payload: &Value) -> Vec<StreamEvent> {
        let usage = payload.get("usage").unwrap_or(payload);

        let input = usage
            .get("inputTokens")
            .and_then(Value::as_u64)
            .unwrap_or(self.input_tokens as u64) as u32;
        let output = usage
            .get("outputTokens")
            .and_then(Value::as_u64)
            .unwrap_or(self.output_tokens as u64) as u32;

        self.input_tokens = input;
        self.output_tokens = output;

        vec![StreamEvent::Usage {
            input_tokens: input,
            output_tokens: output,
        }]
    }
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::new()
    }
}
