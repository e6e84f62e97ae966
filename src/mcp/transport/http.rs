//! HTTP transport.
//!
//! Stateless request/response: every message is one `POST` of the serialised
//! JSON to the configured endpoint, and the reply body is parsed as the
//! answering message. HTTP has no independent receive channel, so
//! [`Transport::receive`] is unsupported.
//!
//! Retrying whole requests belongs to the connection's retry policy, so a
//! transport made with [`HttpConfig::new`] posts each message once. Setting
//! [`HttpConfig::max_retries`] under a connection multiplies the two: a
//! request can then cost `(connection retries + 1) * (max_retries + 1)`
//! posts.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tracing::{debug, trace, warn};

use crate::error::McpError;
use crate::mcp::protocol::{methods, Message, RequestId};
use crate::mcp::transport::Transport;

/// Settings for an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// URL every message is posted to.
    pub endpoint: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Extra posts of one message after a connect failure, timeout or 5xx.
    /// Zero by default.
    pub max_retries: u32,
    /// Headers added to every request.
    pub headers: BTreeMap<String, String>,
}

impl HttpConfig {
    /// Creates a configuration with a 30 s timeout and no in-transport retries.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            max_retries: 0,
            headers: BTreeMap::new(),
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the in-transport retry count, for use without a connection.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Adds a header sent with every request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Transport posting each message to an HTTP endpoint.
#[derive(Debug)]
pub struct HttpTransport {
    config: HttpConfig,
    client: reqwest::Client,
    connected: bool,
}

impl HttpTransport {
    /// Builds the HTTP client. No request is made until
    /// [`Transport::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidParams`] for an invalid header, or
    /// [`McpError::Http`] if the client cannot be built.
    pub fn new(config: HttpConfig) -> Result<Self, McpError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpError::InvalidParams(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::InvalidParams(format!("invalid value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            config,
            client,
            connected: false,
        })
    }

    /// Endpoint messages are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Posts one message and returns the reply body.
    ///
    /// Connection failures, timeouts and 5xx replies are retried up to
    /// `max_retries` times; 4xx replies are not.
    async fn post(&self, message: &Message) -> Result<String, McpError> {
        let body = message.to_json()?;
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            trace!(endpoint = %self.config.endpoint, attempt, %body, "POST");
            let outcome = self
                .client
                .post(&self.config.endpoint)
                .body(body.clone())
                .send()
                .await;

            let error = match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }
                    let text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<unreadable body>".to_string());
                    let error = McpError::Http(format!("{status}: {text}"));
                    if !status.is_server_error() {
                        return Err(error);
                    }
                    error
                }
                Err(e) if e.is_connect() || e.is_timeout() => McpError::from(e),
                Err(e) => return Err(e.into()),
            };

            if attempt >= attempts {
                return Err(error);
            }
            warn!(endpoint = %self.config.endpoint, attempt, error = %error, "HTTP request failed; retrying");
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<(), McpError> {
        if self.connected {
            return Ok(());
        }
        let ping = Message::request(RequestId::from("connect-ping"), methods::PING, None);
        self.post(&ping).await?;
        debug!(endpoint = %self.config.endpoint, "HTTP endpoint reachable");
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    async fn send(&mut self, message: &Message) -> Result<(), McpError> {
        if !self.connected {
            return Err(McpError::NotConnected);
        }
        let reply = self.post(message).await?;
        if !reply.trim().is_empty() {
            debug!(kind = message.kind(), "Discarding HTTP reply body to a one-way send");
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message, McpError> {
        Err(McpError::NotSupported(
            "receive on HTTP transport; use send_and_receive",
        ))
    }

    async fn send_and_receive(&mut self, message: &Message) -> Result<Message, McpError> {
        if !self.connected {
            return Err(McpError::NotConnected);
        }
        let reply = self.post(message).await?;
        trace!(endpoint = %self.config.endpoint, %reply, "reply");
        Ok(Message::parse(&reply)?)
    }

    async fn ping(&mut self) -> bool {
        let request = Message::request(RequestId::from("ping"), methods::PING, None);
        match self.send_and_receive(&request).await {
            Ok(reply) => !reply.is_error(),
            Err(e) => {
                debug!(error = %e, "Ping failed");
                false
            }
        }
    }

    fn connection_info(&self) -> String {
        format!(
            "{} ({})",
            self.config.endpoint,
            if self.connected {
                "connected"
            } else {
                "disconnected"
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_header_is_rejected() {
        let config = HttpConfig::new("http://localhost:1/").with_header("bad header", "x");
        assert!(matches!(
            HttpTransport::new(config),
            Err(McpError::InvalidParams(_))
        ));
    }

    #[test]
    fn posts_once_by_default() {
        let config = HttpConfig::new("http://localhost:1/");
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.with_max_retries(2).max_retries, 2);
    }

    #[tokio::test]
    async fn receive_is_not_supported() {
        let mut transport = HttpTransport::new(HttpConfig::new("http://localhost:1/")).unwrap();
        assert!(matches!(
            transport.receive().await,
            Err(McpError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_to_connect() {
        // Port 1 on localhost is reserved and refuses connections.
        let config = HttpConfig::new("http://127.0.0.1:1/mcp")
            .with_timeout(Duration::from_secs(2))
            .with_max_retries(0);
        let mut transport = HttpTransport::new(config).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_recoverable(), "{err}");
        assert!(!transport.is_connected());
        assert!(transport.connection_info().ends_with("(disconnected)"));
    }
}
