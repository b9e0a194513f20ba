use crate::models::openai::{
    OpenAiChoiceDelta, OpenAiDelta, OpenAiFunctionCallDelta, OpenAiStreamChunk, OpenAiToolCallDelta,
    OpenAiUsage,
};
use crate::streaming::translator::StreamEvent;

/// Maps backend stop reasons onto OpenAI finish reasons.
pub fn finish_reason_for(stop_reason: &str) -> &'static str {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// Renders translator events as OpenAI chat-completion chunks, each
/// returned string one `data:` record; the series ends with a usage
/// chunk and the `[DONE]` sentinel.
pub struct OpenAiEncoder {
    request_id: String,
    model_name: String,
    created: u64,
    role_sent: bool,
    input_tokens: u32,
    output_tokens: u32,
    next_tool_index: u32,
    current_tool_index: Option<u32>,
}

impl OpenAiEncoder {
    pub fn new(model_name: String, created: u64) -> Self {
        Self {
            request_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model_name,
            created,
            role_sent: false,
            input_tokens: 0,
            output_tokens: 0,
            next_tool_index: 0,
            current_tool_index: None,
        }
    }

    pub fn encode(&mut self, event: StreamEvent) -> Vec<String> {
        let mut out = Vec::new();

        if !self.role_sent && event_primes_role(&event) {
            out.push(self.chunk(
                OpenAiDelta {
                    role: Some("assistant".into()),
                    content: Some(String::new()),
                    ..Default::default()
                },
                None,
            ));
            self.role_sent = true;
        }

        match event {
            StreamEvent::TextDelta { text } => {
                self.output_tokens += (text.len() / 4).max(1) as u32;
                out.push(self.chunk(
                    OpenAiDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                ));
            }

            StreamEvent::ToolUseStart { id, name } => {
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                self.current_tool_index = Some(index);
                out.push(self.chunk(
                    OpenAiDelta {
                        tool_calls: Some(vec![OpenAiToolCallDelta {
                            index,
                            id: Some(id),
                            call_type: Some("function".into()),
                            function: OpenAiFunctionCallDelta {
                                name: Some(name),
                                arguments: Some(String::new()),
                            },
                        }]),
                        ..Default::default()
                    },
                    None,
                ));
            }

            StreamEvent::ToolUseDelta { fragment, .. } => {
                if let Some(index) = self.current_tool_index {
                    out.push(self.chunk(
                        OpenAiDelta {
                            tool_calls: Some(vec![OpenAiToolCallDelta {
                                index,
                                id: None,
                                call_type: None,
                                function: OpenAiFunctionCallDelta {
                                    name: None,
                                    arguments: Some(fragment),
                                },
                            }]),
                            ..Default::default()
                        },
                        None,
                    ));
                } else {
                    tracing::warn!("tool delta with no open tool call");
                }
            }

            StreamEvent::ToolUseStop { .. } => {
                // OpenAI tool calls have no per-call terminator.
                self.current_tool_index = None;
            }

            StreamEvent::Usage { input_tokens, output_tokens } => {
                self.input_tokens = input_tokens;
                self.output_tokens = output_tokens;
            }

            StreamEvent::MessageStop { stop_reason } => {
                out.push(self.chunk(
                    OpenAiDelta::default(),
                    Some(finish_reason_for(&stop_reason).to_string()),
                ));
                out.push(self.usage_chunk());
                out.push("data: [DONE]\n\n".to_string());
            }

            StreamEvent::Passthrough { event_type, .. } => {
                // No OpenAI rendering exists; an SSE comment keeps the
                // record visible on the wire without confusing clients.
                out.push(format!(": {event_type}\n\n"));
            }
        }

        out
    }

    /// In-stream error record for a stream that started and cannot finish.
    pub fn format_error(message: &str) -> String {
        let data = serde_json::json!({
            "error": {"message": message, "type": "upstream_error"}
        });
        format!("data: {data}\n\n")
    }

    pub fn token_counts(&self) -> (u32, u32) {
        (self.input_tokens, self.output_tokens)
    }

    fn chunk(&self, delta: OpenAiDelta, finish_reason: Option<String>) -> String {
        let chunk = OpenAiStreamChunk {
            id: self.request_id.clone(),
            object: "chat.completion.chunk".into(),
            created: self.created,
            model: self.model_name.clone(),
            choices: vec![OpenAiChoiceDelta {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        };
        format!(
            "data: {}\n\n",
            serde_json::to_string(&chunk).expect("chunk serializes")
        )
    }

    fn usage_chunk(&self) -> String {
        let chunk = OpenAiStreamChunk {
            id: self.request_id.clone(),
            object: "chat.completion.chunk".into(),
            created: self.created,
            model: self.model_name.clone(),
            choices: vec![],
            usage: Some(OpenAiUsage {
                prompt_tokens: self.input_tokens,
                completion_tokens: self.output_tokens,
                total_tokens: self.input_tokens + self.output_tokens,
            }),
        };
        format!(
            "data: {}\n\n",
            serde_json::to_string(&chunk).expect("chunk serializes")
        )
    }
}

/// Usage bookkeeping never primes the role; everything visible does.
fn event_primes_role(event: &StreamEvent) -> bool {
    !matches!(event, StreamEvent::Usage { .. })
}
