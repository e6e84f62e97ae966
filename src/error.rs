//! Error types for mcp-link.
//!
//! The engine distinguishes four failure classes:
//!
//! - **Transport** failures (refused connection, exited process, I/O timeout) are
//!   recoverable and drive the retry logic in [`crate::mcp::connection`].
//! - **Protocol** failures (malformed JSON, unexpected message shape) are
//!   surfaced immediately.
//! - **Application** failures are JSON-RPC error objects returned by the peer.
//! - **Security** failures are policy violations detected before any
//!   connection attempt is made.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::mcp::protocol::RequestId;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Policy violations raised by [`crate::security::SecurityPolicy`].
///
/// These are never retried and never recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// The executable is not on the command allow-list.
    #[error("command not allowed: {command}; add it to the allowed commands to enable it")]
    CommandNotAllowed {
        /// The rejected command.
        command: String,
    },

    /// An argument contains path traversal or shell metacharacters.
    #[error("argument contains potentially unsafe characters: {argument}")]
    UnsafeArgument {
        /// The rejected argument.
        argument: String,
    },

    /// The URL does not start with any allow-listed prefix.
    #[error("URL not allowed: {url}")]
    UrlNotAllowed {
        /// The rejected URL.
        url: String,
    },

    /// An allow-list has already been set and cannot be changed.
    #[error("the {list} allow-list is already set and cannot be modified")]
    AllowListLocked {
        /// Which allow-list was targeted.
        list: &'static str,
    },

    /// Server settings have been locked.
    #[error("server settings are locked")]
    ServersLocked,

    /// Serving has been vetoed by the security owner.
    #[error("serving is disabled by the security configuration")]
    ServingDisabled,
}

/// Wire-level failures: the bytes arrived but do not form a valid message.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is JSON but not a recognised message.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// Why the message was rejected.
        reason: String,
        /// The request id, when one could be recovered.
        id: Option<RequestId>,
    },

    /// A reply carried a different id from the request it answers.
    #[error("reply id {actual} does not match request id {expected}")]
    IdMismatch {
        /// Id of the request that was sent.
        expected: RequestId,
        /// Id carried by the reply, if any.
        actual: String,
    },

    /// A message of the wrong kind arrived (e.g. a request where a reply was expected).
    #[error("unexpected {kind} message")]
    UnexpectedMessage {
        /// Kind of message that arrived.
        kind: &'static str,
    },
}

impl ProtocolError {
    /// Creates a malformed-message error without a known id.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
            id: None,
        }
    }
}

/// Errors produced by transports, connections, pagination and the dispatcher.
#[derive(Error, Debug)]
pub enum McpError {
    /// Underlying I/O failure (broken pipe, refused connection, ...).
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No complete message arrived within the receive window.
    #[error("timed out after {0:?} waiting for a message")]
    Timeout(Duration),

    /// The peer closed the channel.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The transport is not connected.
    #[error("transport not connected")]
    NotConnected,

    /// The child process is gone.
    #[error("server process exited: {0}")]
    ProcessExited(String),

    /// The HTTP request failed before a usable reply was received.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The in-memory transport has nothing queued.
    #[error("no messages available")]
    QueueEmpty,

    /// The peer sent something that is not a valid message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer answered with a JSON-RPC error object.
    #[error("server returned error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i32,
        /// Error message from the peer.
        message: String,
        /// Optional structured error data.
        data: Option<Value>,
    },

    /// The peer reported that the resource does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// The peer reported that the tool does not exist.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The operation needs an initialised connection.
    #[error("connection not initialised")]
    NotInitialized,

    /// The operation is not available on this transport.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The server has not been started or has been stopped.
    #[error("server is not running")]
    NotRunning,

    /// Invalid arguments supplied by the caller.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The executable could not be located.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// A security policy rejected the operation.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Every attempt failed; wraps the last failure.
    #[error("{method} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// The method that was being sent.
        method: String,
        /// Total number of attempts made.
        attempts: u32,
        /// The failure of the final attempt.
        #[source]
        source: Box<McpError>,
    },
}

impl McpError {
    /// Returns `true` for transport failures, which are eligible for
    /// reconnection and retry.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Timeout(_)
                | Self::ConnectionClosed
                | Self::NotConnected
                | Self::ProcessExited(_)
                | Self::Http(_)
                | Self::QueueEmpty
        )
    }
}

/// Failure reported by a resource provider or tool handler.
///
/// The dispatcher turns it into a JSON-RPC error object carrying the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure text sent back to the client.
    pub message: String,
}

impl HandlerError {
    /// Creates a handler error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Prompt template lookup and rendering failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// No template is registered under the name.
    #[error("Template not found: {0}")]
    NotFound(String),

    /// A required argument was not supplied.
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// An argument value is not a string.
    #[error("Argument '{0}' must be a string")]
    NotAString(String),
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
