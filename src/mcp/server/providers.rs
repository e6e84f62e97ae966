//! Resource providers and tool handlers.
//!
//! The dispatcher calls these synchronously from its loop and imposes no
//! timeout; a provider that can block for long must bound itself.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::HandlerError;
use crate::mcp::types::CallToolResult;

/// Default MIME type for text resources.
pub const TEXT_PLAIN: &str = "text/plain";

/// Content produced by [`ResourceProvider::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceData {
    /// Text content.
    pub text: String,
    /// MIME type of `text`.
    pub mime_type: String,
}

/// A readable resource published under a URI.
pub trait ResourceProvider: Send + Sync {
    /// Produces the current content.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the content cannot be produced.
    fn read(&self) -> Result<ResourceData, HandlerError>;

    /// MIME type advertised in listings.
    fn mime_type(&self) -> String;

    /// Size in bytes, when cheap to determine.
    fn size(&self) -> Option<u64>;

    /// Human-readable description.
    fn description(&self) -> String;

    /// Display name; the URI is used when `None`.
    fn name(&self) -> Option<String> {
        None
    }

    /// Whether the provider caches content that can go stale.
    fn is_refreshable(&self) -> bool {
        false
    }

    /// Whether the cached content is due for a refresh.
    fn should_refresh(&self) -> bool {
        false
    }

    /// Reloads cached content.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the reload fails; the old content is kept.
    fn refresh(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// A callable tool.
pub trait ToolHandler: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Schema the arguments are validated against before [`Self::execute`].
    fn input_schema(&self) -> &ToolInputSchema;

    /// Runs the tool.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the tool rejects its input or fails.
    fn execute(&self, arguments: &Value) -> Result<CallToolResult, HandlerError>;
}

/// Fixed text published as a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticResource {
    text: String,
    mime_type: String,
    description: String,
    name: Option<String>,
}

impl StaticResource {
    /// Creates a `text/plain` resource.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mime_type: TEXT_PLAIN.to_string(),
            description: String::new(),
            name: None,
        }
    }

    /// Sets the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl ResourceProvider for StaticResource {
    fn read(&self) -> Result<ResourceData, HandlerError> {
        Ok(ResourceData {
            text: self.text.clone(),
            mime_type: self.mime_type.clone(),
        })
    }

    fn mime_type(&self) -> String {
        self.mime_type.clone()
    }

    fn size(&self) -> Option<u64> {
        u64::try_from(self.text.len()).ok()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }
}

#[derive(Debug)]
struct Cached {
    text: String,
    loaded_at: Instant,
}

/// A text file on disk published as a resource.
///
/// Without a refresh interval every read goes to disk. With one, the first
/// read loads the file and later reads serve the cached copy until the
/// interval has elapsed.
#[derive(Debug)]
pub struct FileResource {
    path: PathBuf,
    mime_type: String,
    description: String,
    refresh_interval: Option<Duration>,
    cache: Mutex<Option<Cached>>,
}

impl FileResource {
    /// Creates a `text/plain` resource backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mime_type: TEXT_PLAIN.to_string(),
            description: String::new(),
            refresh_interval: None,
            cache: Mutex::new(None),
        }
    }

    /// Sets the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Enables caching with the given lifetime.
    #[must_use]
    pub const fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<String, HandlerError> {
        std::fs::read_to_string(&self.path).map_err(|e| {
            HandlerError::new(format!("failed to read {}: {e}", self.path.display()))
        })
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, Option<Cached>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResourceProvider for FileResource {
    fn read(&self) -> Result<ResourceData, HandlerError> {
        let text = if self.refresh_interval.is_some() {
            let mut cache = self.cache();
            if let Some(cached) = cache.as_ref() {
                cached.text.clone()
            } else {
                let text = self.load()?;
                *cache = Some(Cached {
                    text: text.clone(),
                    loaded_at: Instant::now(),
                });
                text
            }
        } else {
            self.load()?
        };
        Ok(ResourceData {
            text,
            mime_type: self.mime_type.clone(),
        })
    }

    fn mime_type(&self) -> String {
        self.mime_type.clone()
    }

    fn size(&self) -> Option<u64> {
        if let Some(cached) = self.cache().as_ref() {
            return u64::try_from(cached.text.len()).ok();
        }
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn is_refreshable(&self) -> bool {
        self.refresh_interval.is_some()
    }

    fn should_refresh(&self) -> bool {
        let Some(interval) = self.refresh_interval else {
            return false;
        };
        self.cache()
            .as_ref()
            .map_or(true, |cached| cached.loaded_at.elapsed() >= interval)
    }

    fn refresh(&self) -> Result<(), HandlerError> {
        let text = self.load()?;
        debug!(path = %self.path.display(), bytes = text.len(), "Refreshed file resource");
        *self.cache() = Some(Cached {
            text,
            loaded_at: Instant::now(),
        });
        Ok(())
    }
}

/// JSON types a tool argument can be declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    /// A JSON string.
    String,
    /// Any JSON number.
    Number,
    /// A JSON number without a fractional part.
    Integer,
    /// `true` or `false`.
    Boolean,
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
}

impl JsonType {
    /// Name used in JSON Schema.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Whether `value` has this type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Property {
    kind: JsonType,
    description: String,
}

/// Object schema for tool arguments.
///
/// Only what the dispatcher checks is modelled: property types and the
/// required set. Arguments not declared here are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolInputSchema {
    properties: BTreeMap<String, Property>,
    required: Vec<String>,
}

impl ToolInputSchema {
    /// An empty schema accepting any object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an optional property.
    #[must_use]
    pub fn property(
        mut self,
        name: impl Into<String>,
        kind: JsonType,
        description: impl Into<String>,
    ) -> Self {
        self.properties.insert(
            name.into(),
            Property {
                kind,
                description: description.into(),
            },
        );
        self
    }

    /// Declares a required property.
    #[must_use]
    pub fn required(
        self,
        name: impl Into<String>,
        kind: JsonType,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let mut schema = self.property(name.clone(), kind, description);
        if !schema.required.contains(&name) {
            schema.required.push(name);
        }
        schema
    }

    /// Names of the required properties, in declaration order.
    #[must_use]
    pub fn required_names(&self) -> &[String] {
        &self.required
    }

    /// Checks `arguments` against the schema.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first offending property.
    pub fn validate(&self, arguments: &Value) -> Result<(), String> {
        let Some(object) = arguments.as_object() else {
            return Err("arguments must be an object".to_string());
        };
        for name in &self.required {
            if object.get(name).map_or(true, Value::is_null) {
                return Err(format!("missing required argument '{name}'"));
            }
        }
        for (name, property) in &self.properties {
            match object.get(name) {
                Some(value) if !value.is_null() && !property.kind.matches(value) => {
                    return Err(format!(
                        "argument '{name}' must be of type {}",
                        property.kind
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// JSON Schema form advertised in `tools/list`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, property)| {
                let mut entry = json!({ "type": property.kind.as_str() });
                if !property.description.is_empty() {
                    entry["description"] = Value::String(property.description.clone());
                }
                (name.clone(), entry)
            })
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }
}

type ToolFn = dyn Fn(&Value) -> Result<CallToolResult, HandlerError> + Send + Sync;

/// Tool backed by a closure.
pub struct FnTool {
    name: String,
    description: String,
    schema: ToolInputSchema,
    run: Box<ToolFn>,
}

impl FnTool {
    /// Creates a tool that runs `run` on validated arguments.
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ToolInputSchema,
        run: F,
    ) -> Self
    where
        F: Fn(&Value) -> Result<CallToolResult, HandlerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            run: Box::new(run),
        }
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl ToolHandler for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &ToolInputSchema {
        &self.schema
    }

    fn execute(&self, arguments: &Value) -> Result<CallToolResult, HandlerError> {
        (self.run)(arguments)
    }
}
