//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk and parsing
//! it into validated, type-safe structures.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path given as the `CONFIG_FILE` argument
//! 2. Default location:
//!    - **Linux/macOS:** `~/.mcp-link/config.json`
//!    - **Windows:** `%USERPROFILE%\.mcp-link\config.json`
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "logging": { "level": "info" },
//!   "security": {
//!     "allowed_commands": ["/usr/local/bin/docs-server"],
//!     "allowed_urls": ["https://mcp.example.com/"]
//!   },
//!   "server": { "name": "notes", "page_size": 100 },
//!   "resources": [
//!     { "uri": "notes://today", "path": "/srv/notes/today.md",
//!       "mime_type": "text/markdown", "refresh_interval_secs": 60 }
//!   ]
//! }
//! ```

mod settings;

pub use settings::{
    Config, LoggingConfig, PromptArgumentConfig, PromptConfig, ResourceConfig, SecurityConfig,
    ServerSettings,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.mcp-link/`
/// - **Windows:** `%USERPROFILE%\.mcp-link\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".mcp-link"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and parses the configuration file.
///
/// If `path` is `None`, uses the platform-specific default location.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - Required fields are missing or invalid
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or_else(|| ConfigError::NotFound {
            path: PathBuf::from("<default config path>"),
        })?,
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound { path: config_path });
    }

    let contents = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: config_path.clone(),
        source: e,
    })?;

    // Validate the configuration
    config.validate()?;

    Ok(config)
}
