use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Tool descriptor handed to the agent engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema,
        }
    }
}

/// Built-in descriptors the agent always has, independent of tool providers.
pub fn default_baseline() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "web-fetch_page",
            "Fetch a web page and return its content as text.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "URL to fetch"}
                },
                "required": ["url"]
            }),
        ),
        ToolDefinition::new(
            "web-download_file",
            "Download a file from a URL and attach it to the conversation.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "URL of the file"}
                },
                "required": ["url"]
            }),
        ),
    ]
}

/// Collects descriptors during startup. Append-only; `finish` freezes it.
#[derive(Debug, Default)]
pub struct CapabilityListBuilder {
    tools: Vec<ToolDefinition>,
}

impl CapabilityListBuilder {
    pub fn with_baseline(baseline: Vec<ToolDefinition>) -> Self {
        Self { tools: baseline }
    }

    pub fn extend(&mut self, tools: impl IntoIterator<Item = ToolDefinition>) {
        self.tools.extend(tools);
    }

    pub fn finish(self) -> CapabilityList {
        CapabilityList {
            tools: self.tools.into(),
        }
    }
}

/// Frozen capability list shared for the lifetime of the process.
#[derive(Clone, Debug, Default)]
pub struct CapabilityList {
    tools: Arc<[ToolDefinition]>,
}

impl CapabilityList {
    pub fn as_slice(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Serialize for CapabilityList {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.tools.as_ref().serialize(s)
    }
}
