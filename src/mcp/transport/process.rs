//! Subprocess transport.
//!
//! Spawns an MCP server as a child process and exchanges newline-delimited
//! JSON with it over stdin/stdout. The child's stderr is drained on a
//! background task and forwarded to `tracing` at debug level.
//!
//! # Process ownership
//!
//! The transport owns the child for its whole life:
//!
//! - the child gets an explicit minimal environment built by
//!   [`child_environment`], never the parent's full environment;
//! - pipe descriptors are close-on-exec, so they do not leak into processes
//!   the child spawns;
//! - [`Transport::disconnect`] closes stdin, sends `SIGTERM`, waits for the
//!   shutdown grace period, then kills, and always reaps the child;
//! - dropping the transport kills the child (`kill_on_drop`) so no exit path
//!   leaves a stray process behind.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{McpError, ProtocolError};
use crate::mcp::protocol::{methods, Message, RequestId};
use crate::mcp::transport::Transport;
use crate::security::child_environment;

/// Directories searched for bare command names when none are configured.
pub const DEFAULT_SEARCH_PATHS: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin"];

/// Settings for spawning an MCP server process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Executable path or bare name.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
    /// Directories searched when `command` is a bare name.
    pub search_paths: Vec<PathBuf>,
    /// How long [`Transport::receive`] waits for a complete line.
    pub receive_timeout: Duration,
    /// Pause after spawning before checking the child is still alive.
    pub startup_grace: Duration,
    /// How long to wait after `SIGTERM` before killing.
    pub shutdown_grace: Duration,
}

impl ProcessConfig {
    /// Creates a configuration with default timeouts and search paths.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            search_paths: DEFAULT_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
            receive_timeout: Duration::from_secs(5),
            startup_grace: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one environment variable.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replaces the search paths.
    #[must_use]
    pub fn with_search_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the receive timeout.
    #[must_use]
    pub const fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets the startup grace period.
    #[must_use]
    pub const fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Resolves `command` to an executable path.
    ///
    /// Commands containing a `/` are used as given. Bare names are looked up
    /// in `search_paths` in order.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::CommandNotFound`] if no candidate exists.
    pub fn resolve_command(&self) -> Result<PathBuf, McpError> {
        if self.command.contains('/') {
            let path = PathBuf::from(&self.command);
            return if path.is_file() {
                Ok(path)
            } else {
                Err(McpError::CommandNotFound(self.command.clone()))
            };
        }
        self.search_paths
            .iter()
            .map(|dir| dir.join(&self.command))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| McpError::CommandNotFound(self.command.clone()))
    }
}

/// A running child process and its pipes.
struct ChildIo {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
}

/// Transport talking to a child process over its standard streams.
pub struct ProcessTransport {
    config: ProcessConfig,
    io: Option<ChildIo>,
    /// Bytes of a line not yet terminated; kept across timed-out reads.
    pending: Vec<u8>,
    next_ping: u64,
}

impl ProcessTransport {
    /// Creates an unconnected transport. Nothing is spawned until
    /// [`Transport::connect`].
    #[must_use]
    pub const fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            io: None,
            pending: Vec::new(),
            next_ping: 0,
        }
    }

    /// Configuration this transport was built with.
    #[must_use]
    pub const fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Process id of the running child.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.io.as_ref().and_then(|io| io.child.id())
    }

    fn spawn(&self, program: &Path) -> Result<ChildIo, McpError> {
        let mut command = Command::new(program);
        command
            .args(&self.config.args)
            .env_clear()
            .envs(child_environment(&self.config.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                McpError::CommandNotFound(format!("{}: {e}", program.display()))
            }
            _ => McpError::Io(e),
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(stderr, self.config.command.clone()));

        Ok(ChildIo {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr_task,
        })
    }

    fn next_ping_id(&mut self) -> RequestId {
        self.next_ping += 1;
        RequestId::String(format!("ping-{}", self.next_ping))
    }
}

/// Forwards the child's stderr to `tracing` until the pipe closes.
fn drain_stderr(stderr: ChildStderr, command: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(target: "mcp_link::child", %command, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!(target: "mcp_link::child", %command, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn connect(&mut self) -> Result<(), McpError> {
        if self.is_connected() {
            return Ok(());
        }
        // A dead child from an earlier session must be reaped first.
        self.disconnect().await;

        let program = self.config.resolve_command()?;
        let mut io = self.spawn(&program)?;
        let pid = io.child.id();
        debug!(command = %program.display(), ?pid, "Spawned server process");

        tokio::time::sleep(self.config.startup_grace).await;
        if let Some(status) = io.child.try_wait()? {
            if let Some(task) = io.stderr_task.take() {
                let _ = tokio::time::timeout(Duration::from_millis(100), task).await;
            }
            warn!(command = %program.display(), %status, "Server process exited during startup");
            return Err(McpError::ProcessExited(status.to_string()));
        }

        info!(command = %program.display(), ?pid, "Server process started");
        self.pending.clear();
        self.io = Some(io);
        Ok(())
    }

    async fn disconnect(&mut self) {
        let Some(mut io) = self.io.take() else {
            return;
        };
        self.pending.clear();
        // EOF on stdin is the polite way to ask a stdio server to leave.
        drop(io.stdin.take());

        let pid = io.child.id();
        match io.child.try_wait() {
            Ok(Some(status)) => debug!(?pid, %status, "Server process already exited"),
            _ => {
                request_termination(&mut io.child);
                match tokio::time::timeout(self.config.shutdown_grace, io.child.wait()).await {
                    Ok(Ok(status)) => debug!(?pid, %status, "Server process terminated"),
                    Ok(Err(e)) => warn!(?pid, error = %e, "Failed to wait for server process"),
                    Err(_) => {
                        warn!(?pid, "Server process ignored SIGTERM; killing");
                        if let Err(e) = io.child.kill().await {
                            warn!(?pid, error = %e, "Failed to kill server process");
                        }
                    }
                }
            }
        }

        if let Some(task) = io.stderr_task.take() {
            task.abort();
        }
        info!(?pid, "Server process stopped");
    }

    fn is_connected(&mut self) -> bool {
        let Some(io) = self.io.as_mut() else {
            return false;
        };
        io.stdin.is_some() && matches!(io.child.try_wait(), Ok(None))
    }

    async fn send(&mut self, message: &Message) -> Result<(), McpError> {
        let json = message.to_json()?;
        let io = self.io.as_mut().ok_or(McpError::NotConnected)?;
        let stdin = io.stdin.as_mut().ok_or(McpError::NotConnected)?;

        trace!(%json, "send");
        let mut line = json.into_bytes();
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message, McpError> {
        let receive_timeout = self.config.receive_timeout;
        let io = self.io.as_mut().ok_or(McpError::NotConnected)?;

        loop {
            let read = tokio::time::timeout(
                receive_timeout,
                io.stdout.read_until(b'\n', &mut self.pending),
            )
            .await;

            match read {
                Err(_) => return Err(McpError::Timeout(receive_timeout)),
                Ok(Err(e)) => return Err(McpError::Io(e)),
                Ok(Ok(0)) => {
                    self.pending.clear();
                    let status = io.child.try_wait().ok().flatten();
                    return Err(status.map_or(McpError::ConnectionClosed, |status| {
                        McpError::ProcessExited(status.to_string())
                    }));
                }
                Ok(Ok(_)) => {
                    if self.pending.last() != Some(&b'\n') {
                        // Partial line at EOF; the next read reports the hang-up.
                        continue;
                    }
                    let line = std::mem::take(&mut self.pending);
                    let text = String::from_utf8(line).map_err(|_| {
                        ProtocolError::malformed("server output is not valid UTF-8")
                    })?;
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    trace!(line = %text, "receive");
                    return Ok(Message::parse(text)?);
                }
            }
        }
    }

    async fn ping(&mut self) -> bool {
        let id = self.next_ping_id();
        let request = Message::request(id.clone(), methods::PING, None);
        match self.send_and_receive(&request).await {
            Ok(reply) => reply.id() == Some(&id) && !reply.is_error(),
            Err(e) => {
                debug!(error = %e, "Ping failed");
                false
            }
        }
    }

    fn connection_info(&self) -> String {
        let mut info = format!("process://{}", self.config.command);
        for arg in &self.config.args {
            let _ = write!(info, " {arg}");
        }
        if let Some(pid) = self.pid() {
            let _ = write!(info, " (pid: {pid})");
        }
        info
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Some(io) = self.io.as_mut() {
            if let Some(task) = io.stderr_task.take() {
                task.abort();
            }
            let _ = io.child.start_kill();
        }
    }
}
