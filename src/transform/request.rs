use crate::error::Result;
use crate::models::claude::{ClaudeRequest, ContentBlock, ContentType};
use crate::models::kiro::{
    ConversationState, CurrentMessage, HistoryAssistantMessage, HistoryEntry, HistoryToolUse,
    HistoryUserMessage, KiroRequest, ToolResultContent, ToolResultEntry, UserInputMessage,
    UserInputMessageContext,
};
use crate::transform::tools::{ToolSchemaCache, translate_tools};
use crate::transform::map_model_name;

/// Placeholder the backend accepts where a message has no text content
/// (e.g. a user turn that only carries tool results).
const EMPTY_CONTENT: &str = "(empty)";

/// One client message flattened to what the backend can carry.
struct FlatMessage {
    role: String,
    text: String,
    tool_uses: Vec<HistoryToolUse>,
    tool_results: Vec<ToolResultEntry>,
}

fn flatten_message(role: &str, content: &ContentType) -> FlatMessage {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_uses = Vec::new();
    let mut tool_results = Vec::new();

    match content {
        ContentType::Text(text) => text_parts.push(text),
        ContentType::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_uses.push(HistoryToolUse {
                            tool_use_id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        tool_results.push(ToolResultEntry {
                            tool_use_id: tool_use_id.clone(),
                            content: vec![ToolResultContent {
                                text: tool_result_text(content),
                            }],
                            status: if is_error.unwrap_or(false) {
                                "error".to_string()
                            } else {
                                "success".to_string()
                            },
                        });
                    }
                }
            }
        }
    }

    FlatMessage {
        role: role.to_string(),
        text: text_parts.join("\n"),
        tool_uses,
        tool_results,
    }
}

fn tool_result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Merge consecutive same-role messages; the backend requires strict
/// user/assistant alternation in history.
fn merge_alternating(messages: Vec<FlatMessage>) -> Vec<FlatMessage> {
    let mut merged: Vec<FlatMessage> = Vec::new();

    for msg in messages {
        match merged.last_mut() {
            Some(prev) if prev.role == msg.role => {
                if !msg.text.is_empty() {
                    if !prev.text.is_empty() {
                        prev.text.push('\n');
                    }
                    prev.text.push_str(&msg.text);
                }
                prev.tool_uses.extend(msg.tool_uses);
                prev.tool_results.extend(msg.tool_results);
            }
            _ => merged.push(msg),
        }
    }

    merged
}

/// Adapt a validated internal request into the backend payload.
///
/// All history except the final user turn becomes alternating history
/// entries; the final user turn becomes the current message, carrying
/// tool definitions and tool results in its context object.
pub fn adapt_request(req: &ClaudeRequest, cache: &ToolSchemaCache) -> Result<KiroRequest> {
    let model_id = map_model_name(&req.model)?.to_string();

    let mut flat: Vec<FlatMessage> = req
        .messages
        .iter()
        .map(|m| flatten_message(&m.role, &m.content))
        .collect();
    flat = merge_alternating(flat);

    // The backend rejects a history that opens with an assistant turn.
    if flat.first().is_some_and(|m| m.role == "assistant") {
        flat.insert(
            0,
            FlatMessage {
                role: "user".into(),
                text: EMPTY_CONTENT.into(),
                tool_uses: Vec::new(),
                tool_results: Vec::new(),
            },
        );
    }

    let current = if flat.last().is_some_and(|m| m.role == "user") {
        flat.pop().expect("non-empty after validation")
    } else {
        // Conversation ends on an assistant turn; prompt continuation.
        FlatMessage {
            role: "user".into(),
            text: "Continue".into(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    };

    let history = flat
        .into_iter()
        .map(|m| {
            if m.role == "assistant" {
                HistoryEntry::AssistantResponseMessage(HistoryAssistantMessage {
                    content: nonempty(m.text),
                    tool_uses: if m.tool_uses.is_empty() {
                        None
                    } else {
                        Some(m.tool_uses)
                    },
                })
            } else {
                HistoryEntry::UserInputMessage(HistoryUserMessage {
                    content: nonempty(m.text),
                    model_id: model_id.clone(),
                    origin: "AI_EDITOR".into(),
                })
            }
        })
        .collect();

    let mut context = UserInputMessageContext::default();
    if let Some(tools) = &req.tools
        && !tools.is_empty()
    {
        context.tools = Some(translate_tools(tools, cache)?);
    }
    if !current.tool_results.is_empty() {
        context.tool_results = Some(current.tool_results);
    }

    // System prompt folds into the current message; the backend has no
    // dedicated system field.
    let mut content = match &req.system {
        Some(system) => {
            let sys = system.as_text();
            if sys.is_empty() {
                current.text
            } else if current.text.is_empty() {
                sys
            } else {
                format!("{sys}\n\n{}", current.text)
            }
        }
        None => current.text,
    };
    if content.is_empty() {
        content = EMPTY_CONTENT.into();
    }

    tracing::debug!(
        model_id = %model_id,
        history_len = req.messages.len(),
        has_tools = context.tools.is_some(),
        "adapted request for backend"
    );

    Ok(KiroRequest {
        conversation_state: ConversationState {
            chat_trigger_type: "MANUAL".into(),
            conversation_id: uuid::Uuid::new_v4().to_string(),
            current_message: CurrentMessage {
                user_input_message: UserInputMessage {
                    content,
                    model_id,
                    origin: "AI_EDITOR".into(),
                    user_input_message_context: if context.is_empty() {
                        None
                    } else {
                        Some(context)
                    },
                },
            },
            history,
        },
    })
}

fn nonempty(text: String) -> String {
    if text.is_empty() {
        EMPTY_CONTENT.into()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::claude::{ClaudeMessage, ClaudeTool, SystemPrompt};
    use serde_json::json;

    fn simple_request(messages: Vec<ClaudeMessage>) -> ClaudeRequest {
        ClaudeRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages,
            system: None,
            max_tokens: Some(100),
            temperature: None,
            stop_sequences: None,
            stream: true,
            top_p: None,
            top_k: None,
            tools: None,
        }
    }

    fn user(text: &str) -> ClaudeMessage {
        ClaudeMessage {
            role: "user".into(),
            content: ContentType::Text(text.into()),
        }
    }

    fn assistant(text: &str) -> ClaudeMessage {
        ClaudeMessage {
            role: "assistant".into(),
            content: ContentType::Text(text.into()),
        }
    }

    #[test]
    fn test_single_turn_request() {
        let req = simple_request(vec![user("Hi")]);
        let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();

        let state = &kiro.conversation_state;
        assert!(state.history.is_empty());
        assert_eq!(state.current_message.user_input_message.content, "Hi");
        assert_eq!(
            state.current_message.user_input_message.model_id,
            "CLAUDE_SONNET_4_20250514_V1_0"
        );
        assert_eq!(state.chat_trigger_type, "MANUAL");
    }

    #[test]
    fn test_multi_turn_history() {
        let req = simple_request(vec![user("one"), assistant("two"), user("three")]);
        let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();

        let state = &kiro.conversation_state;
        assert_eq!(state.history.len(), 2);
        assert!(matches!(state.history[0], HistoryEntry::UserInputMessage(_)));
        assert!(matches!(
            state.history[1],
            HistoryEntry::AssistantResponseMessage(_)
        ));
        assert_eq!(state.current_message.user_input_message.content, "three");
    }

    #[test]
    fn test_consecutive_roles_merge() {
        let req = simple_request(vec![user("a"), user("b"), assistant("c"), user("d")]);
        let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();

        let state = &kiro.conversation_state;
        assert_eq!(state.history.len(), 2);
        match &state.history[0] {
            HistoryEntry::UserInputMessage(m) => assert_eq!(m.content, "a\nb"),
            other => panic!("expected user entry, got {other:?}"),
        }
    }

    #[test]
    fn test_system_prompt_folds_into_current() {
        let mut req = simple_request(vec![user("Hi")]);
        req.system = Some(SystemPrompt::Text("Be brief.".into()));
        let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();

        assert_eq!(
            kiro.conversation_state.current_message.user_input_message.content,
            "Be brief.\n\nHi"
        );
    }

    #[test]
    fn test_tool_results_ride_in_context() {
        let req = simple_request(vec![
            user("check the weather"),
            ClaudeMessage {
                role: "assistant".into(),
                content: ContentType::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_01".into(),
                    name: "get_weather".into(),
                    input: json!({"city": "Oslo"}),
                }]),
            },
            ClaudeMessage {
                role: "user".into(),
                content: ContentType::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_01".into(),
                    content: json!("rainy"),
                    is_error: None,
                }]),
            },
        ]);
        let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();

        let msg = &kiro.conversation_state.current_message.user_input_message;
        let context = msg.user_input_message_context.as_ref().unwrap();
        let results = context.tool_results.as_ref().unwrap();
        assert_eq!(results[0].tool_use_id, "toolu_01");
        assert_eq!(results[0].content[0].text, "rainy");
        assert_eq!(results[0].status, "success");
        assert_eq!(msg.content, EMPTY_CONTENT);

        // The assistant's tool use stays in history.
        match &kiro.conversation_state.history[1] {
            HistoryEntry::AssistantResponseMessage(m) => {
                assert_eq!(m.tool_uses.as_ref().unwrap()[0].name, "get_weather");
            }
            other => panic!("expected assistant entry, got {other:?}"),
        }
    }

    #[test]
    fn test_tools_translate_into_context() {
        let mut req = simple_request(vec![user("Hi")]);
        req.tools = Some(vec![ClaudeTool {
            name: "get_weather".into(),
            description: "weather lookup".into(),
            input_schema: json!({"type": "object"}),
        }]);
        let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();

        let context = kiro
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .as_ref()
            .unwrap();
        assert_eq!(
            context.tools.as_ref().unwrap()[0].tool_specification.name,
            "get_weather"
        );
    }

    #[test]
    fn test_assistant_opening_gets_user_prefix() {
        let req = simple_request(vec![assistant("hello"), user("Hi")]);
        let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();

        match &kiro.conversation_state.history[0] {
            HistoryEntry::UserInputMessage(m) => assert_eq!(m.content, EMPTY_CONTENT),
            other => panic!("expected synthetic user entry, got {other:?}"),
        }
    }

    #[test]
    fn test_trailing_assistant_prompts_continuation() {
        let req = simple_request(vec![user("Hi"), assistant("partial answer")]);
        let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();

        assert_eq!(
            kiro.conversation_state.current_message.user_input_message.content,
            "Continue"
        );
        assert_eq!(kiro.conversation_state.history.len(), 2);
    }
}
