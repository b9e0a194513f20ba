pub mod openai;
pub mod request;
pub mod tools;

pub use openai::openai_to_claude;
pub use request::adapt_request;
pub use tools::{ToolSchemaCache, translate_tools};

use crate::error::{GatewayError, Result};
use crate::models::claude::{ClaudeRequest, ContentType};

/// Default generation ceiling when the client does not send max_tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Static model table: client-facing Claude model ids to backend model
/// ids. Fuzzy family matching covers dated variants the table does not
/// list explicitly.
const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-3-5-haiku-20241022", "CLAUDE_3_7_SONNET_20250219_V1_0"),
];

pub fn map_model_name(model: &str) -> Result<&'static str> {
    if let Some((_, backend)) = MODEL_MAP.iter().find(|(client, _)| *client == model) {
        return Ok(backend);
    }

    // Family fallback for dated variants.
    if model.contains("sonnet") || model.contains("opus") {
        Ok("CLAUDE_SONNET_4_20250514_V1_0")
    } else if model.contains("haiku") {
        Ok("CLAUDE_3_7_SONNET_20250219_V1_0")
    } else {
        Err(GatewayError::UnsupportedModel(model.to_string()))
    }
}

/// Effective token budget of a request, input to the stream timeout
/// policy.
#[derive(Debug, Clone, Copy)]
pub struct RequestBudget {
    pub input_estimate: u32,
    pub max_tokens: u32,
    pub has_tools: bool,
}

impl RequestBudget {
    pub fn total(&self) -> u32 {
        self.input_estimate.saturating_add(self.max_tokens)
    }
}

/// Estimate a request's token budget from message length, the requested
/// ceiling, and tool definitions. Chars/4 with a correction factor;
/// Claude tokenizes slightly denser than the cl100k heuristic.
pub fn estimate_budget(req: &ClaudeRequest) -> RequestBudget {
    let mut chars = 0usize;

    for msg in &req.messages {
        chars += match &msg.content {
            ContentType::Text(text) => text.len(),
            ContentType::Blocks(blocks) => blocks
                .iter()
                .map(|b| serde_json::to_string(b).map(|s| s.len()).unwrap_or(0))
                .sum(),
        };
    }

    if let Some(system) = &req.system {
        chars += system.as_text().len();
    }

    let has_tools = req.tools.as_ref().is_some_and(|t| !t.is_empty());
    if let Some(tools) = &req.tools {
        for tool in tools {
            chars += tool.description.len();
            chars += serde_json::to_string(&tool.input_schema)
                .map(|s| s.len())
                .unwrap_or(0);
        }
    }

    let input_estimate = ((chars / 4) * 23 / 20).max(1) as u32;

    RequestBudget {
        input_estimate,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        has_tools,
    }
}
