use serde::{Deserialize, Serialize};

/// Anthropic Messages API request.
///
/// This is also the gateway's internal request shape: OpenAI-dialect
/// requests are normalized into it before the backend adaptation runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeRequest {
    /// Model identifier (e.g., "claude-sonnet-4-20250514")
    pub model: String,

    /// Conversation history with user/assistant alternation
    pub messages: Vec<ClaudeMessage>,

    /// Optional system prompt (top-level field)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Temperature (0.0-1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Enable streaming
    #[serde(default)]
    pub stream: bool,

    /// Top-P sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-K sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Tool definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeMessage {
    /// "user" or "assistant"
    pub role: String,

    /// Either a string or an array of content blocks
    pub content: ContentType,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContentType {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    /// Flatten to one plain-text prompt; non-text blocks are skipped.
    pub fn as_text(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Validate an incoming messages request before adaptation.
pub fn validate_claude_request(req: &ClaudeRequest) -> crate::error::Result<()> {
    use crate::error::GatewayError;

    if req.model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("model must not be empty".into()));
    }

    if req.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".into(),
        ));
    }

    for msg in &req.messages {
        if msg.role != "user" && msg.role != "assistant" {
            return Err(GatewayError::InvalidRequest(format!(
                "invalid role: {}",
                msg.role
            )));
        }
    }

    if let Some(temp) = req.temperature
        && !(0.0..=1.0).contains(&temp)
    {
        return Err(GatewayError::InvalidRequest(format!(
            "temperature {temp} out of range [0.0, 1.0]"
        )));
    }

    if let Some(top_p) = req.top_p
        && !(0.0..=1.0).contains(&top_p)
    {
        return Err(GatewayError::InvalidRequest(format!(
            "top_p {top_p} out of range [0.0, 1.0]"
        )));
    }

    if req.max_tokens == Some(0) {
        return Err(GatewayError::InvalidRequest(
            "max_tokens must be greater than 0".into(),
        ));
    }

    Ok(())
}
