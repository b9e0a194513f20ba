use kiro_gateway::handler::stream_deadline;
use kiro_gateway::models::claude::{ClaudeRequest, validate_claude_request};
use kiro_gateway::models::kiro::HistoryEntry;
use kiro_gateway::models::openai::OpenAiRequest;
use kiro_gateway::transform::{
    ToolSchemaCache, adapt_request, estimate_budget, map_model_name, openai_to_claude,
};

fn claude_request(json: serde_json::Value) -> ClaudeRequest {
    serde_json::from_value(json).unwrap()
}

#[test]
fn simple_request_maps_model_and_budget() {
    let req = claude_request(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "Hi"}]
    }));

    validate_claude_request(&req).unwrap();

    let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();
    assert_eq!(
        kiro.conversation_state.current_message.user_input_message.model_id,
        "CLAUDE_SONNET_4_20250514_V1_0"
    );

    let budget = estimate_budget(&req);
    assert_eq!(budget.max_tokens, 100);
    // A tiny request bottoms out at the minimum deadline.
    assert_eq!(stream_deadline(&budget).as_secs(), 60);
}

#[test]
fn tool_request_lengthens_deadline() {
    let plain = claude_request(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "Hi"}]
    }));
    let with_tools = claude_request(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "Hi"}],
        "tools": [{
            "name": "get_weather",
            "description": "weather lookup",
            "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
        }]
    }));

    let plain_deadline = stream_deadline(&estimate_budget(&plain));
    let tool_deadline = stream_deadline(&estimate_budget(&with_tools));
    assert!(tool_deadline > plain_deadline);
}

#[test]
fn serialized_backend_request_is_camel_case() {
    let req = claude_request(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 100,
        "system": "Be brief.",
        "messages": [
            {"role": "user", "content": "one"},
            {"role": "assistant", "content": "two"},
            {"role": "user", "content": "three"}
        ]
    }));

    let kiro = adapt_request(&req, &ToolSchemaCache::new()).unwrap();
    let json = serde_json::to_string_pretty(&kiro).unwrap();

    assert!(json.contains("conversationState"));
    assert!(json.contains("chatTriggerType"));
    assert!(json.contains("userInputMessage"));
    assert!(json.contains("assistantResponseMessage"));

    // Round-trips through the typed model.
    let _: kiro_gateway::models::kiro::KiroRequest = serde_json::from_str(&json).unwrap();
}

#[test]
fn openai_request_normalizes_then_adapts() {
    let openai: OpenAiRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 128,
        "messages": [
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": "Hi"},
            {"role": "assistant", "content": "Hello!"},
            {"role": "user", "content": "What's the weather?"}
        ]
    }))
    .unwrap();

    let claude = openai_to_claude(openai).unwrap();
    validate_claude_request(&claude).unwrap();
    assert_eq!(claude.messages.len(), 3);

    let kiro = adapt_request(&claude, &ToolSchemaCache::new()).unwrap();
    let state = &kiro.conversation_state;
    assert_eq!(state.history.len(), 2);
    assert!(matches!(state.history[0], HistoryEntry::UserInputMessage(_)));
    assert!(
        state
            .current_message
            .user_input_message
            .content
            .starts_with("Be brief.")
    );
}

#[test]
fn openai_tool_round_trip_reaches_backend_shape() {
    let openai: OpenAiRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "messages": [
            {"role": "user", "content": "weather?"},
            {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                }]
            },
            {"role": "tool", "tool_call_id": "call_1", "content": "rainy"}
        ],
        "tools": [{
            "type": "function",
            "function": {
                "name": "get_weather",
                "description": "weather lookup",
                "parameters": {"type": "object"}
            }
        }]
    }))
    .unwrap();

    let claude = openai_to_claude(openai).unwrap();
    let kiro = adapt_request(&claude, &ToolSchemaCache::new()).unwrap();

    let msg = &kiro.conversation_state.current_message.user_input_message;
    let context = msg.user_input_message_context.as_ref().unwrap();
    assert_eq!(
        context.tools.as_ref().unwrap()[0].tool_specification.name,
        "get_weather"
    );
    assert_eq!(
        context.tool_results.as_ref().unwrap()[0].tool_use_id,
        "call_1"
    );
}

#[test]
fn unsupported_model_is_rejected() {
    assert!(map_model_name("gpt-4o").is_err());

    let req = claude_request(serde_json::json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hi"}]
    }));
    assert!(adapt_request(&req, &ToolSchemaCache::new()).is_err());
}

#[test]
fn validation_rejects_malformed_requests() {
    let empty_messages = claude_request(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "messages": []
    }));
    assert!(validate_claude_request(&empty_messages).is_err());

    let bad_role = claude_request(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "messages": [{"role": "narrator", "content": "Hi"}]
    }));
    assert!(validate_claude_request(&bad_role).is_err());

    let bad_temperature = claude_request(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "temperature": 7.5,
        "messages": [{"role": "user", "content": "Hi"}]
    }));
    assert!(validate_claude_request(&bad_temperature).is_err());
}
