//! Payload types carried inside `params` / `result`.
//!
//! These are shared by the client [`Connection`](crate::mcp::connection::Connection)
//! (which parses them out of replies) and the [`McpServer`](crate::mcp::server::McpServer)
//! (which produces them).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::protocol::IMPLEMENTATION_NAME;

#[allow(clippy::trivially_copy_pass_by_ref)] // serde's skip_serializing_if requires a predicate fn(&T) -> bool, so we must take &bool here
const fn is_false(b: &bool) -> bool {
    !*b
}

/// Feature flags a peer declares during `initialize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Resource listing/reading.
    pub resources: bool,
    /// Tool listing/calling.
    pub tools: bool,
    /// Prompt listing/rendering.
    pub prompts: bool,
    /// Sampling requests.
    pub sampling: bool,
}

impl Capabilities {
    /// Reads the `capabilities` object of an `initialize` result.
    ///
    /// A capability counts as supported when its key is present and is not
    /// `false` or `null`, so both `{"tools": {}}` and `{"tools": true}` work.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let flag = |key: &str| {
            value
                .get(key)
                .is_some_and(|v| !v.is_null() && v.as_bool() != Some(false))
        };
        Self {
            resources: flag("resources"),
            tools: flag("tools"),
            prompts: flag("prompts"),
            sampling: flag("sampling"),
        }
    }

    /// Produces the wire form advertised by a server.
    #[must_use]
    pub fn to_value(self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, enabled) in [
            ("resources", self.resources),
            ("tools", self.tools),
            ("prompts", self.prompts),
            ("sampling", self.sampling),
        ] {
            if enabled {
                map.insert(key.to_string(), Value::Object(serde_json::Map::new()));
            }
        }
        Value::Object(map)
    }
}

/// Name and version of a protocol implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    #[serde(default)]
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: IMPLEMENTATION_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A resource entry from `resources/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Resource URI.
    pub uri: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Content size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// One content block from `resources/read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    /// Resource URI.
    pub uri: String,
    /// MIME type of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64-encoded binary content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Result of `resources/read`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// Content blocks.
    #[serde(default)]
    pub contents: Vec<ResourceContent>,
}

impl ReadResourceResult {
    /// Concatenates all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.contents
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result of `resources/list`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    /// Resources on this page.
    #[serde(default)]
    pub resources: Vec<ResourceInfo>,
    /// Cursor for the next page, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// A tool entry from `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    #[serde(default)]
    pub input_schema: Value,
}

/// Result of `tools/list`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    /// Tools on this page.
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    /// Cursor for the next page, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Content item in a tool call response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
}

/// Result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Content returned by the tool.
    #[serde(default)]
    pub content: Vec<ToolContent>,
    /// Whether the tool call resulted in an error.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Creates a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Creates an error text result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// Concatenates all text content.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A prompt entry from `prompts/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptInfo {
    /// Prompt name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared arguments.
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// One declared prompt argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default)]
    pub required: bool,
}

/// Result of `prompts/list`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    /// Prompts on this page.
    #[serde(default)]
    pub prompts: Vec<PromptInfo>,
    /// Cursor for the next page, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result of `prompts/get`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetPromptResult {
    /// Description of the rendered prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rendered messages, kept as raw JSON.
    #[serde(default)]
    pub messages: Vec<Value>,
}
