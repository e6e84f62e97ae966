//! Message transports.
//!
//! A [`Transport`] moves whole [`Message`]s across one channel and owns no
//! message state. Four variants ship with the crate:
//!
//! | Kind            | Type                       | Channel                                   |
//! |-----------------|----------------------------|-------------------------------------------|
//! | `process`       | [`ProcessTransport`]       | child process stdin/stdout, one JSON line per message |
//! | `http`          | [`HttpTransport`]          | one POST per message                      |
//! | `memory`        | [`MemoryTransport`]        | two in-process queues, for tests          |
//! | `server-stdio`  | [`StdioServerTransport`]   | this process's own stdin/stdout           |
//!
//! Client code normally builds transports through [`create_transport`], which
//! consults the [`SecurityPolicy`] before anything is spawned or contacted.

mod http;
mod memory;
mod process;
mod stdio;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::debug;

pub use http::{HttpConfig, HttpTransport};
pub use memory::MemoryTransport;
pub use process::{ProcessConfig, ProcessTransport, DEFAULT_SEARCH_PATHS};
pub use stdio::StdioServerTransport;

use crate::error::{McpError, SecurityError};
use crate::mcp::protocol::Message;
use crate::security::SecurityPolicy;

/// A bidirectional message channel.
///
/// Lifecycle: unconnected, then connected after [`connect`](Self::connect),
/// then closed after [`disconnect`](Self::disconnect) or a peer hang-up.
#[async_trait]
pub trait Transport: Send {
    /// Opens the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be established.
    async fn connect(&mut self) -> Result<(), McpError>;

    /// Closes the channel and releases everything it owns.
    async fn disconnect(&mut self);

    /// Returns `true` while the channel is usable.
    fn is_connected(&mut self) -> bool;

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    async fn send(&mut self, message: &Message) -> Result<(), McpError>;

    /// Waits for the next complete message.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, hang-up, or an unparsable message.
    async fn receive(&mut self) -> Result<Message, McpError>;

    /// Sends a message and waits for the next message in return.
    ///
    /// # Errors
    ///
    /// Returns an error if either half fails.
    async fn send_and_receive(&mut self, message: &Message) -> Result<Message, McpError> {
        self.send(message).await?;
        self.receive().await
    }

    /// Checks that the peer answers a `ping`.
    async fn ping(&mut self) -> bool;

    /// Human-readable description of the channel.
    fn connection_info(&self) -> String;
}

/// Kinds of transport the factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Child process over stdin/stdout.
    Process,
    /// HTTP POST per message.
    Http,
    /// In-process queues.
    Memory,
    /// This process's own stdin/stdout (server side).
    ServerStdio,
}

impl TransportKind {
    /// Canonical name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Http => "http",
            Self::Memory => "memory",
            Self::ServerStdio => "server-stdio",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "stdio" | "subprocess" => Ok(Self::Process),
            "http" | "https" => Ok(Self::Http),
            "memory" => Ok(Self::Memory),
            "server-stdio" | "server_stdio" => Ok(Self::ServerStdio),
            other => Err(McpError::InvalidParams(format!(
                "unknown transport kind: {other}"
            ))),
        }
    }
}

/// Construction parameters for [`create_transport`].
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Spawn a child process.
    Process(ProcessConfig),
    /// Talk to an HTTP endpoint.
    Http(HttpConfig),
    /// Use a queue pair. The caller keeps a clone to drive the other side.
    Memory(MemoryTransport),
    /// Serve on this process's stdin/stdout.
    ServerStdio,
}

impl TransportConfig {
    /// Kind of transport this configuration builds.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::Process(_) => TransportKind::Process,
            Self::Http(_) => TransportKind::Http,
            Self::Memory(_) => TransportKind::Memory,
            Self::ServerStdio => TransportKind::ServerStdio,
        }
    }
}

/// Builds a transport after checking it against the security policy.
///
/// Process transports must pass [`SecurityPolicy::validate_attach`]; HTTP
/// transports must pass [`SecurityPolicy::validate_url`]. Nothing is spawned
/// or contacted here; call [`Transport::connect`] on the result.
///
/// # Errors
///
/// Returns [`McpError::Security`] when the policy rejects the configuration,
/// or [`McpError::Http`] when the HTTP client cannot be built.
pub fn create_transport(
    config: TransportConfig,
    policy: &SecurityPolicy,
) -> Result<Box<dyn Transport>, McpError> {
    debug!(kind = %config.kind(), "Creating transport");
    match config {
        TransportConfig::Process(config) => {
            Ok(Box::new(ProcessTransport::new(authorize_process(config, policy)?)))
        }
        TransportConfig::Http(config) => {
            policy.validate_url(&config.endpoint)?;
            Ok(Box::new(HttpTransport::new(config)?))
        }
        TransportConfig::Memory(transport) => Ok(Box::new(transport)),
        TransportConfig::ServerStdio => Ok(Box::new(StdioServerTransport::stdio())),
    }
}

/// Validates a process configuration and pins its command to the
/// allow-list entry that approved it.
///
/// A bare name approved by basename is replaced with the absolute
/// allow-listed path, so the search paths can never pick a different binary.
///
/// # Errors
///
/// Returns [`McpError::Security`] when the policy rejects the command or an
/// argument.
pub fn authorize_process(
    mut config: ProcessConfig,
    policy: &SecurityPolicy,
) -> Result<ProcessConfig, McpError> {
    policy.validate_attach(&config.command, &config.args)?;
    let approved = policy.allowed_command_path(&config.command).ok_or_else(|| {
        SecurityError::CommandNotAllowed {
            command: config.command.clone(),
        }
    })?;
    if approved != config.command {
        debug!(requested = %config.command, resolved = %approved, "Pinned command to allow-listed path");
        config.command = approved;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing() {
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Process);
        assert_eq!("PROCESS".parse::<TransportKind>().unwrap(), TransportKind::Process);
        assert_eq!("https".parse::<TransportKind>().unwrap(), TransportKind::Http);
        assert_eq!("memory".parse::<TransportKind>().unwrap(), TransportKind::Memory);
        assert_eq!(
            "server-stdio".parse::<TransportKind>().unwrap(),
            TransportKind::ServerStdio
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn kind_display_round_trips() {
        for kind in [
            TransportKind::Process,
            TransportKind::Http,
            TransportKind::Memory,
            TransportKind::ServerStdio,
        ] {
            assert_eq!(kind.to_string().parse::<TransportKind>().unwrap(), kind);
        }
    }

    #[test]
    fn factory_rejects_disallowed_command() {
        let policy = SecurityPolicy::new();
        let config = TransportConfig::Process(ProcessConfig::new("/bin/cat"));
        let err = create_transport(config, &policy).err().unwrap();
        assert!(matches!(
            err,
            McpError::Security(SecurityError::CommandNotAllowed { .. })
        ));
    }

    #[test]
    fn factory_rejects_unsafe_argument() {
        let policy = SecurityPolicy::new();
        policy.set_allowed_commands("/bin/cat").unwrap();
        let config =
            TransportConfig::Process(ProcessConfig::new("/bin/cat").with_args(["; rm -rf /"]));
        let err = create_transport(config, &policy).err().unwrap();
        assert!(matches!(
            err,
            McpError::Security(SecurityError::UnsafeArgument { .. })
        ));
    }

    #[test]
    fn factory_rejects_disallowed_url() {
        let policy = SecurityPolicy::new();
        policy.set_allowed_urls("http://localhost:").unwrap();
        let config = TransportConfig::Http(HttpConfig::new("https://example.com/mcp"));
        let err = create_transport(config, &policy).err().unwrap();
        assert!(matches!(
            err,
            McpError::Security(SecurityError::UrlNotAllowed { .. })
        ));
    }

    #[test]
    fn factory_builds_allowed_transports() {
        let policy = SecurityPolicy::new();
        policy.set_allowed_commands("/bin/cat").unwrap();
        policy.set_allowed_urls("http://localhost:").unwrap();

        let process =
            create_transport(TransportConfig::Process(ProcessConfig::new("cat")), &policy).unwrap();
        assert!(process.connection_info().contains("cat"));

        let http = create_transport(
            TransportConfig::Http(HttpConfig::new("http://localhost:9/mcp")),
            &policy,
        )
        .unwrap();
        assert!(http.connection_info().contains("localhost:9"));

        let memory =
            create_transport(TransportConfig::Memory(MemoryTransport::new()), &policy).unwrap();
        assert_eq!(memory.connection_info(), "memory");
    }

    #[cfg(unix)]
    #[test]
    fn bare_name_is_pinned_to_allow_listed_path() {
        let allowed_dir = tempfile::tempdir().unwrap();
        let shadow_dir = tempfile::tempdir().unwrap();
        for dir in [&allowed_dir, &shadow_dir] {
            std::fs::write(dir.path().join("tool"), "#!/bin/sh\n").unwrap();
        }
        let allowed = allowed_dir.path().join("tool");

        let policy = SecurityPolicy::new();
        policy
            .set_allowed_command_list([allowed.display().to_string()])
            .unwrap();
        assert!(policy.is_command_allowed("tool"));

        let config = ProcessConfig::new("tool")
            .with_search_paths([shadow_dir.path(), allowed_dir.path()]);
        assert_eq!(
            config.resolve_command().unwrap(),
            shadow_dir.path().join("tool")
        );

        let pinned = authorize_process(config, &policy).unwrap();
        assert_eq!(pinned.command, allowed.display().to_string());
        assert_eq!(pinned.resolve_command().unwrap(), allowed);
    }

    #[test]
    fn exact_bare_entry_keeps_search() {
        let policy = SecurityPolicy::new();
        policy.set_allowed_commands("cat").unwrap();
        let pinned = authorize_process(ProcessConfig::new("cat"), &policy).unwrap();
        assert_eq!(pinned.command, "cat");
    }
}
