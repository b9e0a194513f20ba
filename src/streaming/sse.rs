use crate::streaming::translator::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenBlock {
    Text,
    ToolUse,
}

/// Renders translator events as the Anthropic Messages streaming SSE
/// series. Event emission order follows the input order exactly; each
/// returned string is one complete `event:`/`data:` record ready to
/// flush.
pub struct SseEncoder {
    message_id: String,
    model_name: String,
    header_sent: bool,
    input_tokens: u32,
    output_tokens: u32,
    next_block_index: u32,
    open_block: Option<(u32, OpenBlock)>,
}

impl SseEncoder {
    pub fn new(model_name: String) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model_name,
            header_sent: false,
            input_tokens: 0,
            output_tokens: 0,
            next_block_index: 0,
            open_block: None,
        }
    }

    pub fn encode(&mut self, event: StreamEvent) -> Vec<String> {
        let mut out = Vec::new();

        if !self.header_sent {
            // Usage frames can precede the first content frame; fold them
            // into message_start instead of emitting ahead of it.
            if let StreamEvent::Usage { input_tokens, output_tokens } = event {
                self.input_tokens = input_tokens;
                self.output_tokens = output_tokens;
                return out;
            }
            out.push(self.format_message_start());
            self.header_sent = true;
        }

        match event {
            StreamEvent::TextDelta { text } => {
                if self.open_block.map(|(_, kind)| kind) != Some(OpenBlock::Text) {
                    out.extend(self.close_open_block());
                    out.push(self.open_text_block());
                }
                let index = self.open_block.expect("text block open").0;
                // Estimate until the backend reports authoritative usage.
                self.output_tokens += (text.len() / 4).max(1) as u32;
                out.push(format_event(
                    "content_block_delta",
                    &serde_json::json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
            }

            StreamEvent::ToolUseStart { id, name } => {
                out.extend(self.close_open_block());
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.open_block = Some((index, OpenBlock::ToolUse));
                out.push(format_event(
                    "content_block_start",
                    &serde_json::json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": {}
                        }
                    }),
                ));
            }

            StreamEvent::ToolUseDelta { fragment, .. } => {
                if let Some((index, OpenBlock::ToolUse)) = self.open_block {
                    out.push(format_event(
                        "content_block_delta",
                        &serde_json::json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "input_json_delta", "partial_json": fragment}
                        }),
                    ));
                } else {
                    tracing::warn!("tool delta with no open tool block");
                }
            }

            StreamEvent::ToolUseStop { .. } => {
                out.extend(self.close_open_block());
            }

            StreamEvent::Usage { input_tokens, output_tokens } => {
                self.input_tokens = input_tokens;
                self.output_tokens = output_tokens;
            }

            StreamEvent::MessageStop { stop_reason } => {
                out.extend(self.close_open_block());
                out.push(format_event(
                    "message_delta",
                    &serde_json::json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                        "usage": {"output_tokens": self.output_tokens}
                    }),
                ));
                out.push(format_event(
                    "message_stop",
                    &serde_json::json!({"type": "message_stop"}),
                ));
            }

            StreamEvent::Passthrough { event_type, payload } => {
                out.push(format_event(&event_type, &payload));
            }
        }

        out
    }

    /// In-stream error record, appended when a started stream cannot be
    /// completed; distinguishes an aborted stream from a clean stop.
    pub fn format_error(error_type: &str, message: &str) -> String {
        format_event(
            "error",
            &serde_json::json!({
                "type": "error",
                "error": {"type": error_type, "message": message}
            }),
        )
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    pub fn token_counts(&self) -> (u32, u32) {
        (self.input_tokens, self.output_tokens)
    }

    fn format_message_start(&self) -> String {
        format_event(
            "message_start",
            &serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model_name,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0}
                }
            }),
        )
    }

    fn open_text_block(&mut self) -> String {
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some((index, OpenBlock::Text));
        format_event(
            "content_block_start",
            &serde_json::json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""}
            }),
        )
    }

    fn close_open_block(&mut self) -> Option<String> {
        self.open_block.take().map(|(index, _)| {
            format_event(
                "content_block_stop",
                &serde_json::json!({"type": "content_block_stop", "index": index}),
            )
        })
    }
}

fn format_event(event: &str, data: &serde_json::Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}
