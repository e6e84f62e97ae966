//! Client connection state machine.
//!
//! A [`Connection`] owns one [`Transport`] and drives it through
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --initialize--> Initialized
//!                                                 any transport failure --> Error
//! ```
//!
//! Every outbound request goes through [`Connection::send_request_with_retry`]:
//! strictly increasing ids, exponential backoff between attempts, and a
//! reconnect-and-initialize step when the transport is gone and the last
//! failure was recoverable.
//!
//! A connection is shared by reference (`Arc<Connection>`) between callers.
//! The transport sits behind an async mutex, so concurrent requests serialize
//! on the underlying channel; all other state is behind a short-held lock or
//! an atomic.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::{McpError, ProtocolError};
use crate::mcp::protocol::{methods, ErrorCode, Message, RequestId};
use crate::mcp::retry::{Attempt, RetryPolicy};
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    CallToolResult, Capabilities, GetPromptResult, Implementation, ListPromptsResult,
    ListResourcesResult, ListToolsResult, ReadResourceResult,
};

/// Consecutive failures at which a connection is reported unhealthy.
pub const UNHEALTHY_FAILURE_THRESHOLD: u32 = 3;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport session.
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Transport up, handshake not done.
    Connected,
    /// Handshake done; operations allowed.
    Initialized,
    /// The last transport operation failed.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Initialized => "initialized",
            Self::Error => "error",
        })
    }
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    /// Set by the first successful handshake; lets a failed connection
    /// recover through reconnect instead of reporting `NotInitialized`.
    was_initialized: bool,
    capabilities: Capabilities,
    server_info: Option<Implementation>,
    protocol_version: Option<String>,
    last_error: Option<String>,
    last_error_recoverable: bool,
    last_activity: Option<DateTime<Utc>>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            was_initialized: false,
            capabilities: Capabilities::default(),
            server_info: None,
            protocol_version: None,
            last_error: None,
            last_error_recoverable: false,
            last_activity: None,
        }
    }
}

/// A client session with one MCP server.
pub struct Connection {
    server_name: String,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    status: Mutex<Status>,
    next_id: AtomicI64,
    consecutive_failures: AtomicU32,
    retry: RetryPolicy,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server_name", &self.server_name)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a disconnected connection over `transport`.
    #[must_use]
    pub fn new(server_name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            server_name: server_name.into(),
            transport: tokio::sync::Mutex::new(transport),
            status: Mutex::new(Status::default()),
            next_id: AtomicI64::new(1),
            consecutive_failures: AtomicU32::new(0),
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name the connection is registered under.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// Capabilities declared by the server during `initialize`.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.status().capabilities
    }

    /// Server name and version from `initialize`, if the server sent them.
    #[must_use]
    pub fn server_info(&self) -> Option<Implementation> {
        self.status().server_info.clone()
    }

    /// Protocol version the server answered with.
    #[must_use]
    pub fn protocol_version(&self) -> Option<String> {
        self.status().protocol_version.clone()
    }

    /// Text of the most recent failure.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.status().last_error.clone()
    }

    /// Returns `true` when the most recent failure was a transport failure.
    #[must_use]
    pub fn has_recoverable_error(&self) -> bool {
        let status = self.status();
        status.last_error.is_some() && status.last_error_recoverable
    }

    /// Forgets the last failure and resets the failure counter.
    pub fn clear_error(&self) {
        let mut status = self.status();
        status.last_error = None;
        status.last_error_recoverable = false;
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Number of failed attempts since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Time of the most recent attempt.
    #[must_use]
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.status().last_activity
    }

    /// Connected (or initialized) with fewer than
    /// [`UNHEALTHY_FAILURE_THRESHOLD`] consecutive failures.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Initialized
        ) && self.consecutive_failures() < UNHEALTHY_FAILURE_THRESHOLD
    }

    /// Describes the underlying transport.
    pub async fn connection_info(&self) -> String {
        self.transport.lock().await.connection_info()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut status = self.status();
        if status.state != state {
            debug!(server = %self.server_name, from = %status.state, to = %state, "State change");
            status.state = state;
        }
    }

    fn touch(&self) {
        self.status().last_activity = Some(Utc::now());
    }

    fn record_failure(&self, error: &McpError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut status = self.status();
        status.last_error = Some(error.to_string());
        status.last_error_recoverable = error.is_recoverable();
        status.last_activity = Some(Utc::now());
        if error.is_recoverable() {
            status.state = ConnectionState::Error;
        }
        if failures >= UNHEALTHY_FAILURE_THRESHOLD {
            warn!(server = %self.server_name, failures, error = %error, "Connection unhealthy");
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut status = self.status();
        status.last_activity = Some(Utc::now());
        if status.state == ConnectionState::Error {
            status.state = if status.was_initialized {
                ConnectionState::Initialized
            } else {
                ConnectionState::Connected
            };
        }
    }

    /// Opens the transport. Idempotent when already connected.
    ///
    /// # Errors
    ///
    /// Returns the transport's connect error; the state becomes `Error`.
    pub async fn connect(&self) -> Result<(), McpError> {
        let mut transport = self.transport.lock().await;
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Initialized
        ) && transport.is_connected()
        {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match transport.connect().await {
            Ok(()) => {
                info!(server = %self.server_name, info = %transport.connection_info(), "Connected");
                self.touch();
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(server = %self.server_name, error = %e, "Connect failed");
                self.record_failure(&e);
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Performs the `initialize` handshake and sends
    /// `notifications/initialized`.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotConnected`] before [`Self::connect`], or the
    /// failure of either step; the state becomes `Error` and the connection
    /// stays usable for another attempt.
    pub async fn initialize(&self) -> Result<(), McpError> {
        match self.state() {
            ConnectionState::Initialized => return Ok(()),
            ConnectionState::Connected => {}
            _ => return Err(McpError::NotConnected),
        }

        let outcome = self.handshake().await;
        if let Err(e) = &outcome {
            warn!(server = %self.server_name, error = %e, "Initialize failed");
            let mut status = self.status();
            status.state = ConnectionState::Error;
            status.last_error = Some(e.to_string());
            status.last_error_recoverable = e.is_recoverable();
        }
        outcome
    }

    async fn handshake(&self) -> Result<(), McpError> {
        let request = Message::request(self.next_request_id(), methods::INITIALIZE, None);
        let result = self.exchange(&request).await?;

        let capabilities = result
            .get("capabilities")
            .map(Capabilities::from_value)
            .unwrap_or_default();
        let server_info = result
            .get("serverInfo")
            .and_then(|v| serde_json::from_value::<Implementation>(v.clone()).ok());
        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::to_string);

        self.send_notification(methods::INITIALIZED, None).await?;

        info!(
            server = %self.server_name,
            remote = server_info.as_ref().map_or("unknown", |i| i.name.as_str()),
            ?capabilities,
            "Initialized"
        );
        let mut status = self.status();
        status.capabilities = capabilities;
        status.server_info = server_info;
        status.protocol_version = protocol_version;
        status.state = ConnectionState::Initialized;
        status.was_initialized = true;
        Ok(())
    }

    /// Connects and initializes in one step.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn open(&self) -> Result<(), McpError> {
        self.connect().await?;
        self.initialize().await
    }

    /// Closes the transport.
    pub async fn disconnect(&self) {
        let mut transport = self.transport.lock().await;
        transport.disconnect().await;
        drop(transport);
        let mut status = self.status();
        status.state = ConnectionState::Disconnected;
        status.was_initialized = false;
        info!(server = %self.server_name, "Disconnected");
    }

    async fn reconnect(&self) -> Result<(), McpError> {
        info!(server = %self.server_name, "Reconnecting");
        {
            let mut transport = self.transport.lock().await;
            transport.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.connect().await?;
        self.initialize().await
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Sends one request and waits for its reply, with no retry.
    ///
    /// Notifications or requests arriving before the reply are logged and
    /// skipped, as are late replies to earlier requests of this connection
    /// (an attempt that timed out and was retried).
    async fn exchange(&self, request: &Message) -> Result<Value, McpError> {
        let expected = request.id().cloned();
        let reply = {
            let mut transport = self.transport.lock().await;
            let mut reply = transport.send_and_receive(request).await;
            while let Ok(message) = &reply {
                if message.is_reply() {
                    if !is_stale_reply(message, expected.as_ref()) {
                        break;
                    }
                    debug!(
                        server = %self.server_name,
                        id = ?message.id(),
                        expected = ?expected,
                        "Discarding late reply to an earlier request"
                    );
                } else {
                    debug!(
                        server = %self.server_name,
                        kind = message.kind(),
                        method = message.method().unwrap_or_default(),
                        "Skipping unsolicited message"
                    );
                }
                reply = transport.receive().await;
            }
            reply
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };

        let id_matches = match (reply.id(), expected.as_ref()) {
            (Some(actual), Some(expected)) => actual == expected,
            // An error reply without an id answers a request the peer could not parse.
            (None, _) => reply.is_error(),
            (Some(_), None) => false,
        };
        if !id_matches {
            let error = McpError::Protocol(ProtocolError::IdMismatch {
                expected: expected.unwrap_or(RequestId::Number(0)),
                actual: reply
                    .id()
                    .map_or_else(|| "null".to_string(), ToString::to_string),
            });
            self.record_failure(&error);
            return Err(error);
        }

        self.record_success();
        reply.into_result()
    }

    async fn attempt(&self, method: &str, params: Option<Value>, number: u32) -> Attempt<Value> {
        let connected = self.transport.lock().await.is_connected();
        if !connected {
            if !self.has_recoverable_error() {
                return Attempt::Fatal(McpError::NotConnected);
            }
            if let Err(e) = self.reconnect().await {
                return Attempt::from_result(Err(e));
            }
        }

        let request = Message::request(self.next_request_id(), method, params);
        debug!(server = %self.server_name, method, id = ?request.id(), attempt = number, "Sending request");
        Attempt::from_result(self.exchange(&request).await)
    }

    /// Sends a request using the connection's retry policy.
    ///
    /// # Errors
    ///
    /// See [`Self::send_request_with_retry`].
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.send_request_with_retry(method, params, self.retry.max_retries)
            .await
    }

    /// Sends a request, retrying recoverable failures up to `max_retries`
    /// times with the connection's backoff between attempts.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotConnected`] when there is no session to
    /// recover, the peer's error reply as [`McpError::Rpc`], a protocol error,
    /// or [`McpError::RetriesExhausted`] wrapping the last transport failure.
    pub async fn send_request_with_retry(
        &self,
        method: &str,
        params: Option<Value>,
        max_retries: u32,
    ) -> Result<Value, McpError> {
        let policy = RetryPolicy {
            max_retries,
            backoff: Arc::clone(&self.retry.backoff),
        };
        policy
            .run(method, |number| self.attempt(method, params.clone(), number))
            .await
    }

    /// Sends a notification. Notifications are not retried.
    ///
    /// # Errors
    ///
    /// Returns the transport error.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let message = Message::notification(method, params);
        let outcome = self.transport.lock().await.send(&message).await;
        match &outcome {
            Ok(()) => self.touch(),
            Err(e) => self.record_failure(e),
        }
        outcome
    }

    fn require_initialized(&self) -> Result<(), McpError> {
        let status = self.status();
        match status.state {
            ConnectionState::Initialized => Ok(()),
            ConnectionState::Error if status.was_initialized && status.last_error_recoverable => {
                Ok(())
            }
            _ => Err(McpError::NotInitialized),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        self.require_initialized()?;
        let result = self.send_request(method, params).await?;
        serde_json::from_value(result).map_err(|e| {
            McpError::from(ProtocolError::malformed(format!(
                "unexpected {method} result: {e}"
            )))
        })
    }

    /// Fetches one raw page of a list endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotInitialized`] before the handshake, or the
    /// request's error.
    pub async fn list_page(
        &self,
        method: &str,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Value, McpError> {
        self.require_initialized()?;
        let mut params = Map::new();
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            params.insert("cursor".to_string(), Value::String(cursor.to_string()));
        }
        if let Some(limit) = limit {
            params.insert("limit".to_string(), Value::from(limit));
        }
        let params = (!params.is_empty()).then_some(Value::Object(params));
        self.send_request(method, params).await
    }

    /// Lists one page of resources.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotInitialized`] before the handshake, or the
    /// request's error.
    pub async fn list_resources(&self, cursor: Option<&str>) -> Result<ListResourcesResult, McpError> {
        let params = cursor_params(cursor);
        self.call(methods::RESOURCES_LIST, params).await
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ResourceNotFound`] when the server does not know
    /// `uri`, otherwise the request's error.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.call(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await
            .map_err(|e| match e {
                McpError::Rpc { code, .. } if code == ErrorCode::ResourceNotFound.code() => {
                    McpError::ResourceNotFound(uri.to_string())
                }
                other => other,
            })
    }

    /// Returns `true` when `uri` can be read.
    ///
    /// # Errors
    ///
    /// Returns errors other than "not found".
    pub async fn resource_exists(&self, uri: &str) -> Result<bool, McpError> {
        match self.read_resource(uri).await {
            Ok(_) => Ok(true),
            Err(McpError::ResourceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists one page of tools.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotInitialized`] before the handshake, or the
    /// request's error.
    pub async fn list_tools(&self, cursor: Option<&str>) -> Result<ListToolsResult, McpError> {
        let params = cursor_params(cursor);
        self.call(methods::TOOLS_LIST, params).await
    }

    /// Calls a tool.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ToolNotFound`] when the server does not know
    /// `name`, otherwise the request's error. A tool that ran and reported
    /// failure is a successful call with `is_error` set.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        self.call(
            methods::TOOLS_CALL,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
        .map_err(|e| match e {
            McpError::Rpc { code, .. } if code == ErrorCode::ToolNotFound.code() => {
                McpError::ToolNotFound(name.to_string())
            }
            other => other,
        })
    }

    /// Lists one page of prompts.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotInitialized`] before the handshake, or the
    /// request's error.
    pub async fn list_prompts(&self, cursor: Option<&str>) -> Result<ListPromptsResult, McpError> {
        let params = cursor_params(cursor);
        self.call(methods::PROMPTS_LIST, params).await
    }

    /// Renders a prompt.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotInitialized`] before the handshake, or the
    /// request's error.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult, McpError> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.call(methods::PROMPTS_GET, Some(params)).await
    }

    /// Sends a single `ping` (no retry).
    pub async fn ping(&self) -> bool {
        match self.send_request_with_retry(methods::PING, None, 0).await {
            Ok(_) => true,
            Err(e) => {
                debug!(server = %self.server_name, error = %e, "Ping failed");
                false
            }
        }
    }
}

/// Whether `reply` answers a request this connection sent before `expected`.
///
/// Request ids are allocated in increasing order, so any numeric id below the
/// one being waited for belongs to an abandoned attempt.
fn is_stale_reply(reply: &Message, expected: Option<&RequestId>) -> bool {
    match (reply.id(), expected) {
        (Some(RequestId::Number(actual)), Some(RequestId::Number(expected))) => actual < expected,
        _ => false,
    }
}

fn cursor_params(cursor: Option<&str>) -> Option<Value> {
    cursor
        .filter(|c| !c.is_empty())
        .map(|c| json!({ "cursor": c }))
}

/// Name → connection map shared by the components that attach servers.
///
/// Duplicate registration replaces the earlier entry (last writer wins) and
/// hands the replaced connection back to the caller.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection under its server name.
    ///
    /// Returns the connection previously registered under that name.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let name = connection.server_name().to_string();
        let previous = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), connection);
        if previous.is_some() {
            warn!(server = %name, "Replaced existing connection");
        } else {
            debug!(server = %name, "Registered connection");
        }
        previous
    }

    /// Looks up a connection.
    #[must_use]
    pub fn get(&self, server_name: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_name)
            .cloned()
    }

    /// Returns `true` if a connection is registered under `server_name`.
    #[must_use]
    pub fn contains(&self, server_name: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(server_name)
    }

    /// Removes a connection without disconnecting it.
    pub fn unregister(&self, server_name: &str) -> Option<Arc<Connection>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_name)
    }

    /// Removes a connection and closes its transport.
    ///
    /// Returns `false` if nothing was registered under `server_name`.
    pub async fn remove(&self, server_name: &str) -> bool {
        match self.unregister(server_name) {
            Some(connection) => {
                connection.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Registered server names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and disconnects every connection.
    pub async fn disconnect_all(&self) {
        let drained: Vec<Arc<Connection>> = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in drained {
            connection.disconnect().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mcp::protocol::{ErrorObject, Request};
    use crate::mcp::retry::NoBackoff;
    use async_trait::async_trait;

    type Handler = Box<dyn FnMut(&Request) -> Result<Message, McpError> + Send>;

    struct Script {
        handler: Handler,
        connected: bool,
        connects: u32,
        requests: Vec<Request>,
        notifications: Vec<String>,
    }

    /// Transport answering requests through a closure.
    #[derive(Clone)]
    pub(crate) struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(
            handler: impl FnMut(&Request) -> Result<Message, McpError> + Send + 'static,
        ) -> Self {
            Self {
                script: Arc::new(Mutex::new(Script {
                    handler: Box::new(handler),
                    connected: false,
                    connects: 0,
                    requests: Vec::new(),
                    notifications: Vec::new(),
                })),
            }
        }

        /// Answers `initialize` with tools + resources and everything else
        /// through `handler`.
        pub(crate) fn server(
            mut handler: impl FnMut(&Request) -> Result<Message, McpError> + Send + 'static,
        ) -> Self {
            Self::new(move |req| {
                if req.method == methods::INITIALIZE {
                    Ok(Message::response(
                        req.id.clone(),
                        json!({
                            "protocolVersion": "2024-11-05",
                            "capabilities": {"tools": {}, "resources": {}},
                            "serverInfo": {"name": "scripted", "version": "1.0"}
                        }),
                    ))
                } else {
                    handler(req)
                }
            })
        }

        pub(crate) fn requests_for(&self, method: &str) -> Vec<Request> {
            self.script
                .lock()
                .unwrap()
                .requests
                .iter()
                .filter(|r| r.method == method)
                .cloned()
                .collect()
        }

        pub(crate) fn connects(&self) -> u32 {
            self.script.lock().unwrap().connects
        }

        pub(crate) fn notifications(&self) -> Vec<String> {
            self.script.lock().unwrap().notifications.clone()
        }

        pub(crate) fn drop_connection(&self) {
            self.script.lock().unwrap().connected = false;
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&mut self) -> Result<(), McpError> {
            let mut script = self.script.lock().unwrap();
            script.connected = true;
            script.connects += 1;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.script.lock().unwrap().connected = false;
        }

        fn is_connected(&mut self) -> bool {
            self.script.lock().unwrap().connected
        }

        async fn send(&mut self, message: &Message) -> Result<(), McpError> {
            if let Some(method) = message.method() {
                self.script
                    .lock()
                    .unwrap()
                    .notifications
                    .push(method.to_string());
            }
            Ok(())
        }

        async fn receive(&mut self) -> Result<Message, McpError> {
            Err(McpError::QueueEmpty)
        }

        async fn send_and_receive(&mut self, message: &Message) -> Result<Message, McpError> {
            let Message::Request(request) = message else {
                return Err(McpError::NotSupported("scripted transport answers requests only"));
            };
            let mut script = self.script.lock().unwrap();
            script.requests.push(request.clone());
            (script.handler)(request)
        }

        async fn ping(&mut self) -> bool {
            true
        }

        fn connection_info(&self) -> String {
            "scripted".to_string()
        }
    }

    pub(crate) async fn open(transport: &ScriptedTransport) -> Connection {
        let connection = Connection::new("test", Box::new(transport.clone()))
            .with_retry_policy(RetryPolicy::new(3, NoBackoff));
        connection.open().await.unwrap();
        connection
    }

    fn rpc_error(req: &Request, code: ErrorCode) -> Message {
        Message::error(Some(req.id.clone()), ErrorObject::from_code(code))
    }

    #[tokio::test]
    async fn handshake_parses_capabilities_and_notifies() {
        let transport = ScriptedTransport::server(|req| Ok(Message::response(req.id.clone(), json!({}))));
        let connection = open(&transport).await;

        assert_eq!(connection.state(), ConnectionState::Initialized);
        let caps = connection.capabilities();
        assert!(caps.tools && caps.resources && !caps.prompts);
        assert_eq!(connection.server_info().unwrap().name, "scripted");
        assert_eq!(connection.protocol_version().as_deref(), Some("2024-11-05"));
        assert_eq!(transport.notifications(), vec![methods::INITIALIZED.to_string()]);
        assert!(connection.is_healthy());
        assert!(connection.last_activity().is_some());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let transport = ScriptedTransport::server(|req| Ok(Message::response(req.id.clone(), json!({}))));
        let connection = open(&transport).await;
        connection.connect().await.unwrap();
        assert_eq!(transport.connects(), 1);
        assert_eq!(connection.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn operations_require_initialize() {
        let transport = ScriptedTransport::server(|req| Ok(Message::response(req.id.clone(), json!({}))));
        let connection = Connection::new("test", Box::new(transport.clone()));
        assert!(matches!(
            connection.list_tools(None).await,
            Err(McpError::NotInitialized)
        ));
        connection.connect().await.unwrap();
        assert!(matches!(
            connection.read_resource("x").await,
            Err(McpError::NotInitialized)
        ));
        assert!(transport.requests_for(methods::RESOURCES_READ).is_empty());
    }

    #[tokio::test]
    async fn initialize_before_connect_fails() {
        let transport = ScriptedTransport::server(|req| Ok(Message::response(req.id.clone(), json!({}))));
        let connection = Connection::new("test", Box::new(transport));
        assert!(matches!(
            connection.initialize().await,
            Err(McpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let mut failures = 0;
        let transport = ScriptedTransport::server(move |req| {
            if failures < 2 {
                failures += 1;
                Err(McpError::Timeout(std::time::Duration::from_millis(1)))
            } else {
                Ok(Message::response(req.id.clone(), json!({"tools": []})))
            }
        });
        let connection = open(&transport).await;

        let tools = connection.list_tools(None).await.unwrap();
        assert!(tools.tools.is_empty());
        assert_eq!(transport.requests_for(methods::TOOLS_LIST).len(), 3);
        assert_eq!(connection.consecutive_failures(), 0);
        assert_eq!(connection.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn gives_up_after_four_attempts() {
        let transport = ScriptedTransport::server(|_| Err(McpError::ConnectionClosed));
        let connection = open(&transport).await;

        let err = connection.list_tools(None).await.unwrap_err();
        assert!(
            matches!(err, McpError::RetriesExhausted { attempts: 4, .. }),
            "{err}"
        );
        assert!(err.to_string().contains("connection closed"));
        assert_eq!(transport.requests_for(methods::TOOLS_LIST).len(), 4);
        assert_eq!(connection.consecutive_failures(), 4);
        assert!(!connection.is_healthy());
        assert!(connection.has_recoverable_error());
        assert_eq!(connection.state(), ConnectionState::Error);

        connection.clear_error();
        assert_eq!(connection.consecutive_failures(), 0);
        assert!(connection.last_error().is_none());
    }

    #[tokio::test]
    async fn request_ids_strictly_increase() {
        let transport = ScriptedTransport::server(|req| Ok(Message::response(req.id.clone(), json!({}))));
        let connection = open(&transport).await;
        for _ in 0..3 {
            connection.send_request(methods::PING, None).await.unwrap();
        }
        let ids: Vec<i64> = transport
            .requests_for(methods::PING)
            .iter()
            .map(|r| match r.id {
                RequestId::Number(n) => n,
                RequestId::String(_) => panic!("string id"),
            })
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn reconnects_after_lost_transport() {
        let transport = ScriptedTransport::server(|req| {
            Ok(Message::response(req.id.clone(), json!({"resources": []})))
        });
        let connection = open(&transport).await;

        // Simulate the child going away before the first request.
        transport.drop_connection();
        connection.record_failure(&McpError::ConnectionClosed);

        let result = connection.list_resources(None).await.unwrap();
        assert!(result.resources.is_empty());
        assert_eq!(transport.connects(), 2);
        assert_eq!(transport.requests_for(methods::INITIALIZE).len(), 2);
        assert_eq!(connection.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn lost_transport_without_recoverable_error_fails_fast() {
        let transport = ScriptedTransport::server(|req| Ok(Message::response(req.id.clone(), json!({}))));
        let connection = open(&transport).await;
        transport.drop_connection();

        let err = connection.send_request(methods::PING, None).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected));
        assert!(transport.requests_for(methods::PING).is_empty());
    }

    #[tokio::test]
    async fn not_found_codes_are_translated_and_not_retried() {
        let transport = ScriptedTransport::server(|req| match req.method.as_str() {
            methods::RESOURCES_READ => Ok(rpc_error(req, ErrorCode::ResourceNotFound)),
            methods::TOOLS_CALL => Ok(rpc_error(req, ErrorCode::ToolNotFound)),
            _ => Ok(rpc_error(req, ErrorCode::InvalidParams)),
        });
        let connection = open(&transport).await;

        assert!(matches!(
            connection.read_resource("data://missing").await,
            Err(McpError::ResourceNotFound(uri)) if uri == "data://missing"
        ));
        assert!(!connection.resource_exists("data://missing").await.unwrap());
        assert!(matches!(
            connection.call_tool("nope", json!({})).await,
            Err(McpError::ToolNotFound(name)) if name == "nope"
        ));
        assert!(matches!(
            connection.list_prompts(None).await,
            Err(McpError::Rpc { code: -32602, .. })
        ));
        assert_eq!(transport.requests_for(methods::TOOLS_CALL).len(), 1);
        assert!(connection.is_healthy());
    }

    #[tokio::test]
    async fn mismatched_reply_id_is_a_protocol_error() {
        let transport =
            ScriptedTransport::server(|_| Ok(Message::response(RequestId::from(999), json!({}))));
        let connection = open(&transport).await;
        let err = connection.send_request(methods::PING, None).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::Protocol(ProtocolError::IdMismatch { .. })
        ));
        assert_eq!(transport.requests_for(methods::PING).len(), 1);
    }

    #[tokio::test]
    async fn list_and_call_parse_results() {
        let transport = ScriptedTransport::server(|req| {
            let result = match req.method.as_str() {
                methods::RESOURCES_LIST => json!({
                    "resources": [{"uri": "data://a", "name": "a"}],
                    "nextCursor": "data://a"
                }),
                methods::TOOLS_LIST => json!({
                    "tools": [{"name": "echo", "inputSchema": {"type": "object"}}]
                }),
                methods::TOOLS_CALL => json!({"content": [{"type": "text", "text": "hi"}]}),
                methods::RESOURCES_READ => json!({
                    "contents": [{"uri": "data://a", "mimeType": "text/plain", "text": "alpha"}]
                }),
                methods::PROMPTS_GET => json!({"messages": [{"role": "user"}]}),
                _ => json!({}),
            };
            Ok(Message::response(req.id.clone(), result))
        });
        let connection = open(&transport).await;

        let resources = connection.list_resources(None).await.unwrap();
        assert_eq!(resources.resources[0].uri, "data://a");
        assert_eq!(resources.next_cursor.as_deref(), Some("data://a"));

        let tools = connection.list_tools(Some("cursor-1")).await.unwrap();
        assert_eq!(tools.tools[0].name, "echo");
        let sent = transport.requests_for(methods::TOOLS_LIST);
        assert_eq!(sent[0].params, Some(json!({"cursor": "cursor-1"})));

        let called = connection.call_tool("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(called.text_content(), "hi");

        let read = connection.read_resource("data://a").await.unwrap();
        assert_eq!(read.text(), "alpha");
        assert!(connection.resource_exists("data://a").await.unwrap());

        let prompt = connection.get_prompt("p", None).await.unwrap();
        assert_eq!(prompt.messages.len(), 1);

        assert!(connection.ping().await);
        assert_eq!(connection.connection_info().await, "scripted");
    }

    #[tokio::test]
    async fn disconnect_resets_state() {
        let transport = ScriptedTransport::server(|req| Ok(Message::response(req.id.clone(), json!({}))));
        let connection = open(&transport).await;
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.list_tools(None).await,
            Err(McpError::NotInitialized)
        ));
    }

    #[test]
    fn registry_last_writer_wins() {
        let registry = ConnectionRegistry::new();
        let first = Arc::new(Connection::new(
            "alpha",
            Box::new(ScriptedTransport::new(|_| Err(McpError::QueueEmpty))),
        ));
        let second = Arc::new(Connection::new(
            "alpha",
            Box::new(ScriptedTransport::new(|_| Err(McpError::QueueEmpty))),
        ));

        assert!(registry.register(Arc::clone(&first)).is_none());
        let previous = registry.register(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&registry.get("alpha").unwrap(), &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["alpha".to_string()]);

        assert!(registry.unregister("alpha").is_some());
        assert!(registry.is_empty());
        assert!(!registry.contains("alpha"));
    }

    #[tokio::test]
    async fn registry_remove_disconnects() {
        let transport = ScriptedTransport::server(|req| Ok(Message::response(req.id.clone(), json!({}))));
        let registry = ConnectionRegistry::new();
        registry.register(Arc::new(open(&transport).await));

        assert!(registry.remove("test").await);
        assert!(!registry.remove("test").await);
        assert!(!transport.clone().is_connected());
    }

    /// Transport whose first answer to a non-handshake request misses the
    /// receive window and only arrives ahead of the next answer.
    #[derive(Default)]
    struct LateTransport {
        connected: bool,
        timed_out: bool,
        queued: std::collections::VecDeque<Message>,
    }

    #[async_trait]
    impl Transport for LateTransport {
        async fn connect(&mut self) -> Result<(), McpError> {
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&mut self) -> bool {
            self.connected
        }

        async fn send(&mut self, _message: &Message) -> Result<(), McpError> {
            Ok(())
        }

        async fn receive(&mut self) -> Result<Message, McpError> {
            self.queued.pop_front().ok_or(McpError::QueueEmpty)
        }

        async fn send_and_receive(&mut self, message: &Message) -> Result<Message, McpError> {
            let Message::Request(request) = message else {
                return Err(McpError::NotSupported("requests only"));
            };
            if request.method == methods::INITIALIZE {
                return Ok(Message::response(
                    request.id.clone(),
                    json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
                ));
            }
            let attempt = if self.timed_out { "fresh" } else { "late" };
            self.queued
                .push_back(Message::response(request.id.clone(), json!({ "answer": attempt })));
            if !self.timed_out {
                self.timed_out = true;
                return Err(McpError::Timeout(std::time::Duration::from_millis(10)));
            }
            self.receive().await
        }

        async fn ping(&mut self) -> bool {
            self.connected
        }

        fn connection_info(&self) -> String {
            "late".to_string()
        }
    }

    #[tokio::test]
    async fn late_reply_to_timed_out_attempt_is_discarded() {
        let connection = Connection::new("slow", Box::new(LateTransport::default()))
            .with_retry_policy(RetryPolicy::new(3, NoBackoff));
        connection.open().await.unwrap();

        let result = connection.send_request(methods::TOOLS_LIST, None).await.unwrap();
        assert_eq!(result, json!({"answer": "fresh"}));
        assert_eq!(connection.consecutive_failures(), 0);
        assert!(connection.is_healthy());
    }

    #[test]
    fn stale_reply_detection() {
        let expected = RequestId::Number(5);
        let earlier = Message::response(RequestId::Number(4), json!({}));
        let current = Message::response(RequestId::Number(5), json!({}));
        let foreign = Message::response(RequestId::from("x"), json!({}));
        assert!(is_stale_reply(&earlier, Some(&expected)));
        assert!(!is_stale_reply(&current, Some(&expected)));
        assert!(!is_stale_reply(&foreign, Some(&expected)));
    }
}
