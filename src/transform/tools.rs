use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::{GatewayError, Result};
use crate::models::claude::ClaudeTool;
use crate::models::kiro::{InputSchema, ToolEntry, ToolSpecification};

/// Backend limit on tool names.
const TOOL_NAME_MAX_LENGTH: usize = 64;

/// Backend tool names: alphanumerics, underscore, hyphen, capped length.
/// Returns None when nothing survives sanitation.
pub fn sanitize_tool_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(TOOL_NAME_MAX_LENGTH)
        .collect();

    if cleaned.is_empty() { None } else { Some(cleaned) }
}

fn translate_tool(tool: &ClaudeTool) -> Result<ToolEntry> {
    let name = sanitize_tool_name(&tool.name).ok_or_else(|| {
        GatewayError::InvalidRequest(format!("tool name {:?} is not representable", tool.name))
    })?;

    Ok(ToolEntry {
        tool_specification: ToolSpecification {
            name,
            description: tool.description.clone(),
            input_schema: InputSchema {
                json: tool.input_schema.clone(),
            },
        },
    })
}

/// Cache of translated tool schemas keyed by tool name. Tools are defined
/// once and resent on every request, so reads vastly outnumber writes;
/// ArcSwap keeps the read path lock-free.
#[derive(Clone)]
pub struct ToolSchemaCache {
    cache: Arc<ArcSwap<HashMap<String, ToolEntry>>>,
}

impl ToolSchemaCache {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(ArcSwap::from_pointee(HashMap::new())),
        }
    }

    pub fn get_or_translate(&self, tool: &ClaudeTool) -> Result<ToolEntry> {
        {
            let cache = self.cache.load();
            if let Some(cached) = cache.get(&tool.name) {
                return Ok(cached.clone());
            }
        }

        tracing::debug!(tool_name = %tool.name, "translating tool schema");
        let translated = translate_tool(tool)?;

        self.cache.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(tool.name.clone(), translated.clone());
            next
        });

        Ok(translated)
    }

    pub fn len(&self) -> usize {
        self.cache.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.load().is_empty()
    }

    pub fn clear(&self) {
        self.cache.store(Arc::new(HashMap::new()));
    }
}

impl Default for ToolSchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

pub fn translate_tools(tools: &[ClaudeTool], cache: &ToolSchemaCache) -> Result<Vec<ToolEntry>> {
    tools.iter().map(|t| cache.get_or_translate(t)).collect()
}
