use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::models::claude::{
    ClaudeMessage, ClaudeRequest, ClaudeTool, ContentBlock, ContentType, SystemPrompt,
};
use crate::models::openai::{OpenAiMessage, OpenAiRequest};

/// Normalize an OpenAI chat-completions request into the gateway's
/// internal (Anthropic-shaped) request. System messages lift into the
/// top-level system prompt, assistant tool_calls become tool_use blocks,
/// and tool-role messages become user tool_result blocks.
pub fn openai_to_claude(req: OpenAiRequest) -> Result<ClaudeRequest> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                let text = content_text(msg);
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" => messages.push(ClaudeMessage {
                role: "user".into(),
                content: ContentType::Text(content_text(msg)),
            }),
            "assistant" => messages.push(assistant_message(msg)?),
            "tool" => {
                let tool_use_id = msg.tool_call_id.clone().ok_or_else(|| {
                    GatewayError::InvalidRequest(
                        "tool message missing tool_call_id".into(),
                    )
                })?;
                messages.push(ClaudeMessage {
                    role: "user".into(),
                    content: ContentType::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id,
                        content: Value::String(content_text(msg)),
                        is_error: None,
                    }]),
                });
            }
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unsupported role: {other}"
                )));
            }
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| ClaudeTool {
                name: t.function.name,
                description: t.function.description,
                input_schema: t.function.parameters,
            })
            .collect()
    });

    Ok(ClaudeRequest {
        model: req.model,
        messages,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(SystemPrompt::Text(system_parts.join("\n")))
        },
        max_tokens: req.max_completion_tokens.or(req.max_tokens),
        temperature: req.temperature,
        stop_sequences: req.stop,
        stream: req.stream,
        top_p: req.top_p,
        top_k: None,
        tools,
    })
}

fn assistant_message(msg: &OpenAiMessage) -> Result<ClaudeMessage> {
    let text = content_text(msg);

    let Some(tool_calls) = &msg.tool_calls else {
        return Ok(ClaudeMessage {
            role: "assistant".into(),
            content: ContentType::Text(text),
        });
    };

    let mut blocks = Vec::new();
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }
    for call in tool_calls {
        // Arguments arrive as a JSON-encoded string; an unparseable one
        // is preserved verbatim rather than rejected.
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or_else(|_| Value::String(call.function.arguments.clone()));
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input,
        });
    }

    Ok(ClaudeMessage {
        role: "assistant".into(),
        content: ContentType::Blocks(blocks),
    })
}

/// Flatten OpenAI message content (string or part array) to plain text.
fn content_text(msg: &OpenAiMessage) -> String {
    match &msg.content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
