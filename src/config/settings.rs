//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, SecurityError};
use crate::mcp::protocol::IMPLEMENTATION_NAME;
use crate::mcp::server::{
    FileResource, HttpServerConfig, PromptTemplate, ResourceProvider, ServerConfig, StaticResource,
};
use crate::security::SecurityPolicy;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Allow-lists and locks.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Dispatcher settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Resources published by the server.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,

    /// Prompt templates published by the server.
    #[serde(default)]
    pub prompts: Vec<PromptConfig>,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.require_auth
            && self
                .server
                .auth_token
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(invalid("server.require_auth is set but no auth_token is configured"));
        }

        if self.server.page_size == Some(0) {
            return Err(invalid("server.page_size must be at least 1"));
        }

        let mut seen = std::collections::HashSet::new();
        for resource in &self.resources {
            resource.validate()?;
            if !seen.insert(resource.uri.as_str()) {
                return Err(invalid(format!("duplicate resource uri '{}'", resource.uri)));
            }
        }

        let mut names = std::collections::HashSet::new();
        for prompt in &self.prompts {
            if prompt.name.trim().is_empty() {
                return Err(invalid("prompt name must not be empty"));
            }
            if !names.insert(prompt.name.as_str()) {
                return Err(invalid(format!("duplicate prompt name '{}'", prompt.name)));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Security configuration.
///
/// Applied once at startup; the allow-lists cannot be widened afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Executables that may be spawned as MCP servers.
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    /// URL prefixes that may be contacted over HTTP.
    #[serde(default)]
    pub allowed_urls: Vec<String>,

    /// File listing known servers.
    #[serde(default)]
    pub server_file: Option<PathBuf>,

    /// Forbid further changes to server settings.
    #[serde(default)]
    pub lock_servers: bool,

    /// Refuse to run the server role at all.
    #[serde(default)]
    pub serving_disabled: bool,
}

impl SecurityConfig {
    /// Copies these settings into `policy`, locking it as requested.
    ///
    /// # Errors
    ///
    /// Returns a [`SecurityError`] if the policy already has different
    /// allow-lists or its server settings are locked.
    pub fn apply(&self, policy: &SecurityPolicy) -> Result<(), SecurityError> {
        if !self.allowed_commands.is_empty() {
            policy.set_allowed_command_list(&self.allowed_commands)?;
        }
        if !self.allowed_urls.is_empty() {
            policy.set_allowed_url_list(&self.allowed_urls)?;
        }
        if let Some(path) = &self.server_file {
            policy.set_server_file(path.clone())?;
        }
        if self.lock_servers {
            policy.lock_servers();
        }
        if self.serving_disabled {
            policy.disable_serving();
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Name reported to clients.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Require clients to present `auth_token`.
    #[serde(default)]
    pub require_auth: bool,

    /// Token clients must present.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Maximum entries per list page.
    #[serde(default)]
    pub page_size: Option<usize>,

    /// Serve HTTP on this address instead of stdin/stdout.
    #[serde(default)]
    pub http_bind: Option<SocketAddr>,

    /// Send CORS headers from the HTTP front end.
    #[serde(default = "default_cors")]
    pub cors: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            require_auth: false,
            auth_token: None,
            page_size: None,
            http_bind: None,
            cors: default_cors(),
        }
    }
}

fn default_server_name() -> String {
    IMPLEMENTATION_NAME.to_string()
}

const fn default_cors() -> bool {
    true
}

impl ServerSettings {
    /// Dispatcher settings for [`crate::mcp::server::McpServer::new`].
    #[must_use]
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            name: self.name.clone(),
            require_auth: self.require_auth,
            auth_token: self.auth_token.clone(),
            page_size: self.page_size,
        }
    }

    /// HTTP front end settings.
    #[must_use]
    pub const fn to_http_config(&self) -> HttpServerConfig {
        HttpServerConfig {
            enable_cors: self.cors,
        }
    }
}

/// One published resource: inline text or a file on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// URI the resource is published under.
    pub uri: String,

    /// Inline content.
    #[serde(default)]
    pub text: Option<String>,

    /// File whose content is served.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// MIME type; `text/plain` when absent.
    #[serde(default)]
    pub mime_type: Option<String>,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Cache a file's content for this many seconds.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

impl ResourceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.trim().is_empty() {
            return Err(invalid("resource uri must not be empty"));
        }
        match (&self.text, &self.path) {
            (Some(_), Some(_)) => Err(invalid(format!(
                "resource '{}' sets both text and path",
                self.uri
            ))),
            (None, None) => Err(invalid(format!(
                "resource '{}' needs either text or path",
                self.uri
            ))),
            (Some(_), None) if self.refresh_interval_secs.is_some() => Err(invalid(format!(
                "resource '{}': refresh_interval_secs only applies to path resources",
                self.uri
            ))),
            _ => Ok(()),
        }
    }

    /// Builds the provider serving this resource.
    #[must_use]
    pub fn provider(&self) -> Arc<dyn ResourceProvider> {
        let description = self.description.clone().unwrap_or_default();
        if let Some(path) = &self.path {
            let mut resource = FileResource::new(path.clone()).with_description(description);
            if let Some(mime_type) = &self.mime_type {
                resource = resource.with_mime_type(mime_type.clone());
            }
            if let Some(secs) = self.refresh_interval_secs {
                resource = resource.with_refresh_interval(Duration::from_secs(secs));
            }
            return Arc::new(resource);
        }

        let mut resource = StaticResource::new(self.text.clone().unwrap_or_default())
            .with_description(description);
        if let Some(mime_type) = &self.mime_type {
            resource = resource.with_mime_type(mime_type.clone());
        }
        Arc::new(resource)
    }
}

/// One published prompt template.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptConfig {
    /// Name clients pass to `prompts/get`.
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Text with `{argument}` placeholders.
    pub template: String,

    /// Declared arguments.
    #[serde(default)]
    pub arguments: Vec<PromptArgumentConfig>,
}

/// One declared prompt argument.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptArgumentConfig {
    /// Placeholder name.
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Whether `prompts/get` must supply it.
    #[serde(default)]
    pub required: bool,
}

impl PromptConfig {
    /// Builds the template this entry describes.
    #[must_use]
    pub fn template(&self) -> PromptTemplate {
        self.arguments.iter().fold(
            PromptTemplate::new(&self.name, &self.description, &self.template),
            |template, arg| template.argument(&arg.name, &arg.description, arg.required),
        )
    }
}
