//! Server-side stdio transport.
//!
//! Half-duplex framing over the process's own standard streams:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stdin: receives messages from the client
//! - stdout: sends messages to the client
//! - stderr: may be used for logging (not protocol messages)
//!
//! The server only ever receives and then replies, so
//! [`Transport::send_and_receive`] is rejected. The reader and writer are
//! generic so tests can bind the transport to in-process pipes.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::error::McpError;
use crate::mcp::protocol::Message;
use crate::mcp::transport::Transport;

/// Line-framed transport over a reader/writer pair.
pub struct StdioServerTransport<R, W> {
    /// Buffered input.
    reader: R,
    /// Output.
    writer: W,
    /// Label used in logs and [`Transport::connection_info`].
    label: String,
    /// Cleared on EOF or disconnect.
    connected: bool,
}

impl StdioServerTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    /// Binds the transport to this process's stdin and stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            "stdio",
        )
    }
}

impl<R, W> StdioServerTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Binds the transport to an arbitrary reader/writer pair.
    #[must_use]
    pub fn new(reader: R, writer: W, label: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            label: label.into(),
            connected: true,
        }
    }

    /// Reads the next message line.
    ///
    /// Returns `None` on EOF.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }

    /// Writes one line and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub async fn write_line(&mut self, json: &str) -> io::Result<()> {
        // Framing relies on messages never containing a raw newline.
        debug_assert!(
            !json.contains('\n'),
            "message must not contain embedded newlines"
        );

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl<R, W> Transport for StdioServerTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn connect(&mut self) -> Result<(), McpError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            debug!(transport = %self.label, "Closing server transport");
        }
        self.connected = false;
        let _ = self.writer.flush().await;
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    async fn send(&mut self, message: &Message) -> Result<(), McpError> {
        if !self.connected {
            return Err(McpError::NotConnected);
        }
        let json = message.to_json()?;
        trace!(transport = %self.label, %json, "send");
        self.write_line(&json).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message, McpError> {
        if !self.connected {
            return Err(McpError::NotConnected);
        }
        loop {
            let Some(line) = self.read_line().await? else {
                debug!(transport = %self.label, "Input closed");
                self.connected = false;
                return Err(McpError::ConnectionClosed);
            };
            if line.trim().is_empty() {
                continue;
            }
            trace!(transport = %self.label, %line, "receive");
            return Ok(Message::parse(&line)?);
        }
    }

    async fn send_and_receive(&mut self, _message: &Message) -> Result<Message, McpError> {
        Err(McpError::NotSupported(
            "send_and_receive on a server-side transport",
        ))
    }

    async fn ping(&mut self) -> bool {
        self.connected
    }

    fn connection_info(&self) -> String {
        format!("server-stdio ({})", self.label)
    }
}
