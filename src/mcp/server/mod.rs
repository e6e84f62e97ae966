//! Server-side dispatcher.
//!
//! [`McpServer`] receives messages from a server-side [`Transport`], routes
//! requests to the resource and tool registries, and writes one reply per
//! request. Its lifecycle:
//!
//! 1. **Start**: [`McpServer::start`] consults the security policy, which may
//!    veto serving entirely.
//! 2. **Serve**: each connection runs its own [`Session`] in a
//!    receive/handle/send loop, and several connections may be served at
//!    once. A handler failure becomes an error reply; only unparsable input
//!    or a closed channel ends the loop. [`http`] serves the same dispatcher
//!    over `POST` with bearer-token checks.
//! 3. **Shutdown**: a `shutdown` request, [`McpServer::stop`], or a
//!    termination signal in [`McpServer::run_stdio`].
//!
//! All state lives in the server instance, so independent servers can run
//! side by side in one process.

pub mod http;
pub mod providers;
pub mod registry;
pub mod templates;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{McpError, ProtocolError, TemplateError};
use crate::mcp::protocol::{
    methods, ErrorCode, ErrorObject, ErrorResponse, Message, Notification, Request,
    IMPLEMENTATION_NAME, MCP_PROTOCOL_VERSION,
};
use crate::mcp::transport::{StdioServerTransport, Transport};
use crate::mcp::types::{
    Capabilities, Implementation, ListPromptsResult, ListResourcesResult, ListToolsResult,
    ReadResourceResult, ResourceContent, ResourceInfo, ToolInfo,
};
use crate::security::SecurityPolicy;

pub use providers::{
    FileResource, FnTool, JsonType, ResourceData, ResourceProvider, StaticResource, ToolHandler,
    ToolInputSchema,
};
pub use http::HttpServerConfig;
pub use registry::{ResourceRegistry, ToolRegistry};
pub use templates::{PromptTemplate, TemplateArguments, TemplateRegistry};

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Name reported in `serverInfo`.
    pub name: String,
    /// Reject requests from sessions without a matching credential.
    pub require_auth: bool,
    /// Bearer token clients must present when `require_auth` is set.
    pub auth_token: Option<String>,
    /// Maximum entries per `resources/list` / `tools/list` / `prompts/list` page.
    pub page_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: IMPLEMENTATION_NAME.to_string(),
            require_auth: false,
            auth_token: None,
            page_size: None,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with the given server name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Requires every session to present `token`.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.require_auth = true;
        self.auth_token = Some(token.into());
        self
    }

    /// Paginates list replies.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Not serving.
    Stopped,
    /// Accepting requests.
    Running,
    /// A `shutdown` request was answered; the loop ends after the reply.
    ShuttingDown,
}

impl ServerState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the serve loop should keep going after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next message.
    Continue,
    /// End the connection.
    Stop,
}

/// Per-connection state.
///
/// Every connection gets its own session, so one client's handshake never
/// affects another's. The credential is whatever the transport authenticated
/// the peer with; stream transports have none.
#[derive(Debug, Default)]
pub struct Session {
    initialized: AtomicBool,
    credential: Option<String>,
}

impl Session {
    /// Creates an uninitialised session without a credential.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session whose peer presented `token`.
    #[must_use]
    pub fn with_credential(token: impl Into<String>) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            credential: Some(token.into()),
        }
    }

    /// Whether `initialize` has been answered on this session.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Token the peer authenticated with.
    #[must_use]
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }
}

#[derive(Debug, Default)]
struct Counters {
    active_connections: AtomicUsize,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    errors_returned: AtomicU64,
}

/// Decrements the active connection count when a serve loop ends, including
/// when its future is dropped by a signal.
struct ActiveConnection<'a>(&'a Counters);

impl<'a> ActiveConnection<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.active_connections.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time view of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// Server name.
    pub name: String,
    /// Lifecycle state.
    pub state: ServerState,
    /// Connections currently being served.
    pub active_connections: usize,
    /// Requests handled since creation.
    pub requests_received: u64,
    /// Replies written to a transport.
    pub responses_sent: u64,
    /// Error replies written to a transport.
    pub errors_returned: u64,
    /// When the server last started.
    pub started_at: Option<DateTime<Utc>>,
    /// Whole seconds since `started_at`.
    pub uptime_secs: u64,
    /// Published resources.
    pub resources: usize,
    /// Registered tools.
    pub tools: usize,
    /// Registered prompt templates.
    pub prompts: usize,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} connection(s), {} requests, {} responses, {} errors, {} resources, {} tools, {} prompts, up {}s",
            self.name,
            self.state,
            self.active_connections,
            self.requests_received,
            self.responses_sent,
            self.errors_returned,
            self.resources,
            self.tools,
            self.prompts,
            self.uptime_secs,
        )
    }
}

struct Shared {
    config: ServerConfig,
    resources: ResourceRegistry,
    tools: ToolRegistry,
    templates: TemplateRegistry,
    state: Mutex<ServerState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    counters: Counters,
    stopped: Notify,
}

/// Request dispatcher with its resource and tool registries.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct McpServer {
    shared: Arc<Shared>,
}

impl fmt::Debug for McpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpServer")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .field("resources", &self.shared.resources.len())
            .field("tools", &self.shared.tools.len())
            .field("prompts", &self.shared.templates.len())
            .finish_non_exhaustive()
    }
}

impl McpServer {
    /// Creates a stopped server with empty registries.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                resources: ResourceRegistry::new(),
                tools: ToolRegistry::new(),
                templates: TemplateRegistry::new(),
                state: Mutex::new(ServerState::Stopped),
                started_at: Mutex::new(None),
                counters: Counters::default(),
                stopped: Notify::new(),
            }),
        }
    }

    /// Settings the server was created with.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Published resources.
    #[must_use]
    pub fn resources(&self) -> &ResourceRegistry {
        &self.shared.resources
    }

    /// Registered tools.
    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.shared.tools
    }

    /// Publishes a resource, returning the one it replaced.
    pub fn publish_resource(
        &self,
        uri: impl Into<String>,
        provider: Arc<dyn ResourceProvider>,
    ) -> Option<Arc<dyn ResourceProvider>> {
        self.shared.resources.register(uri, provider)
    }

    /// Withdraws a resource. Returns `true` if it was published.
    pub fn unpublish_resource(&self, uri: &str) -> bool {
        self.shared.resources.unregister(uri)
    }

    /// Registers a tool under its name, returning the one it replaced.
    pub fn register_tool(&self, handler: Arc<dyn ToolHandler>) -> Option<Arc<dyn ToolHandler>> {
        self.shared.tools.add(handler)
    }

    /// Removes a tool. Returns `true` if it was registered.
    pub fn unregister_tool(&self, name: &str) -> bool {
        self.shared.tools.unregister(name)
    }

    /// Registered prompt templates.
    #[must_use]
    pub fn templates(&self) -> &TemplateRegistry {
        &self.shared.templates
    }

    /// Registers a prompt template under its name, returning the one it replaced.
    pub fn register_template(&self, template: PromptTemplate) -> Option<Arc<PromptTemplate>> {
        self.shared.templates.add(template)
    }

    /// Removes a prompt template. Returns `true` if it was registered.
    pub fn unregister_template(&self, name: &str) -> bool {
        self.shared.templates.unregister(name)
    }

    fn state_lock(&self) -> MutexGuard<'_, ServerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServerState) {
        *self.state_lock() = state;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state_lock()
    }

    /// Whether the server accepts requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Starts serving.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Security`] when the policy has disabled serving.
    pub fn start(&self, policy: &SecurityPolicy) -> Result<(), McpError> {
        policy.check_serving()?;
        let mut state = self.state_lock();
        if *state == ServerState::Running {
            return Ok(());
        }
        *state = ServerState::Running;
        drop(state);
        *self
            .shared
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        info!(server = %self.shared.config.name, "Server started");
        Ok(())
    }

    /// Stops serving and wakes any serve loop blocked on input.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state_lock(), ServerState::Stopped);
        self.shared.stopped.notify_waiters();
        if previous != ServerState::Stopped {
            info!(server = %self.shared.config.name, "Server stopped");
        }
    }

    /// Snapshot of the counters and registry sizes.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        let counters = &self.shared.counters;
        let started_at = *self
            .shared
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let uptime_secs = started_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .map_or(0, |uptime| uptime.as_secs());
        ServerStatus {
            name: self.shared.config.name.clone(),
            state: self.state(),
            active_connections: counters.active_connections.load(Ordering::SeqCst),
            requests_received: counters.requests_received.load(Ordering::SeqCst),
            responses_sent: counters.responses_sent.load(Ordering::SeqCst),
            errors_returned: counters.errors_returned.load(Ordering::SeqCst),
            started_at,
            uptime_secs,
            resources: self.shared.resources.len(),
            tools: self.shared.tools.len(),
            prompts: self.shared.templates.len(),
        }
    }

    /// Resolves once the server leaves the running state.
    pub(crate) async fn stopped(&self) {
        loop {
            let stopped = self.shared.stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            if !self.is_running() {
                return;
            }
            stopped.await;
        }
    }

    /// Serves `transport` in a fresh [`Session`] until it closes, a
    /// `shutdown` request is answered, or [`Self::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotRunning`] before [`Self::start`], or the
    /// transport's error if it cannot connect.
    pub async fn serve(&self, transport: &mut dyn Transport) -> Result<(), McpError> {
        self.serve_session(&Session::new(), transport).await
    }

    /// Serves `transport` within an existing session.
    ///
    /// # Errors
    ///
    /// As for [`Self::serve`].
    pub async fn serve_session(
        &self,
        session: &Session,
        transport: &mut dyn Transport,
    ) -> Result<(), McpError> {
        if !self.is_running() {
            return Err(McpError::NotRunning);
        }
        transport.connect().await?;
        let peer = transport.connection_info();
        let _active = ActiveConnection::enter(&self.shared.counters);
        info!(server = %self.shared.config.name, transport = %peer, "Serving connection");

        loop {
            let stopped = self.shared.stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            if !self.is_running() {
                break;
            }
            tokio::select! {
                () = &mut stopped => break,
                flow = self.serve_next(session, &mut *transport) => {
                    if flow == Flow::Stop {
                        break;
                    }
                }
            }
        }

        transport.disconnect().await;
        if self.state() == ServerState::ShuttingDown {
            self.stop();
        }
        info!(server = %self.shared.config.name, transport = %peer, "Connection finished");
        Ok(())
    }

    /// Serves `transport` on a background task.
    pub fn spawn(&self, mut transport: Box<dyn Transport>) -> JoinHandle<Result<(), McpError>> {
        let server = self.clone();
        tokio::spawn(async move { server.serve(transport.as_mut()).await })
    }

    /// Serves this process's stdin/stdout until EOF, `shutdown`, or SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be installed or
    /// [`Self::serve`] fails.
    #[cfg(unix)]
    pub async fn run_stdio(&self) -> Result<(), McpError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut transport = StdioServerTransport::stdio();

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            result = self.serve(&mut transport) => return result,
        }
        self.stop();
        Ok(())
    }

    /// Serves this process's stdin/stdout until EOF, `shutdown`, or Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns an error if [`Self::serve`] fails.
    #[cfg(windows)]
    pub async fn run_stdio(&self) -> Result<(), McpError> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut transport = StdioServerTransport::stdio();

        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
            result = self.serve(&mut transport) => return result,
        }
        self.stop();
        Ok(())
    }

    /// Receives one message, handles it within `session`, and writes the reply.
    pub async fn serve_next(&self, session: &Session, transport: &mut dyn Transport) -> Flow {
        match transport.receive().await {
            Ok(message) => {
                let shutdown = matches!(
                    &message,
                    Message::Request(request) if request.method == methods::SHUTDOWN
                );
                if let Some(reply) = self.handle_message(session, message) {
                    if let Err(e) = self.reply(transport, &reply).await {
                        error!(error = %e, "Failed to send reply");
                        return Flow::Stop;
                    }
                }
                if shutdown {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            Err(McpError::Protocol(ProtocolError::Json(e))) => {
                warn!(error = %e, "Unparsable input; closing connection");
                let reply = Message::from(ErrorResponse::parse_error());
                if let Err(e) = self.reply(transport, &reply).await {
                    debug!(error = %e, "Could not report parse error");
                }
                Flow::Stop
            }
            Err(McpError::Protocol(ProtocolError::MalformedMessage { reason, id })) => {
                warn!(%reason, "Malformed message");
                let reply = Message::from(ErrorResponse::invalid_request(id, reason));
                match self.reply(transport, &reply).await {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        error!(error = %e, "Failed to send reply");
                        Flow::Stop
                    }
                }
            }
            Err(McpError::ConnectionClosed | McpError::QueueEmpty) => {
                debug!("No more input");
                Flow::Stop
            }
            Err(e) => {
                error!(error = %e, "Receive failed");
                Flow::Stop
            }
        }
    }

    async fn reply(&self, transport: &mut dyn Transport, reply: &Message) -> Result<(), McpError> {
        transport.send(reply).await?;
        self.count_reply(reply);
        Ok(())
    }

    pub(crate) fn count_reply(&self, reply: &Message) {
        let counters = &self.shared.counters;
        counters.responses_sent.fetch_add(1, Ordering::SeqCst);
        if reply.is_error() {
            counters.errors_returned.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Handles any incoming message within `session`. Only requests produce
    /// a reply.
    pub fn handle_message(&self, session: &Session, message: Message) -> Option<Message> {
        match message {
            Message::Request(request) => Some(self.handle_request(session, &request)),
            Message::Notification(notification) => {
                self.handle_notification(&notification);
                None
            }
            other => {
                debug!(kind = other.kind(), id = ?other.id(), "Ignoring unsolicited reply");
                None
            }
        }
    }

    /// Handles one request and always produces a reply carrying its id.
    ///
    /// Handler failures, including panics, become error replies.
    pub fn handle_request(&self, session: &Session, request: &Request) -> Message {
        self.shared
            .counters
            .requests_received
            .fetch_add(1, Ordering::SeqCst);
        debug!(method = %request.method, id = %request.id, "Request");

        let outcome = self.authenticate(session, request).and_then(|()| {
            panic::catch_unwind(AssertUnwindSafe(|| self.route(session, request))).unwrap_or_else(
                |payload| {
                    let message = panic_message(payload.as_ref());
                    error!(method = %request.method, %message, "Handler panicked");
                    Err(ErrorObject::with_message(ErrorCode::InternalError, message))
                },
            )
        });

        match outcome {
            Ok(result) => Message::response(request.id.clone(), result),
            Err(error) => {
                debug!(method = %request.method, id = %request.id, code = error.code, message = %error.message, "Error reply");
                Message::error(Some(request.id.clone()), error)
            }
        }
    }

    fn handle_notification(&self, notification: &Notification) {
        match notification.method.as_str() {
            methods::INITIALIZED => debug!("Client finished initialisation"),
            methods::CANCELLED => debug!(params = ?notification.params, "Client cancelled a request"),
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    fn authenticate(&self, session: &Session, request: &Request) -> Result<(), ErrorObject> {
        let config = &self.shared.config;
        if !config.require_auth {
            return Ok(());
        }
        match (session.credential(), config.auth_token.as_deref()) {
            (Some(token), Some(expected)) if token == expected => Ok(()),
            (None, _) => {
                warn!(method = %request.method, "Rejected unauthenticated request");
                Err(ErrorObject::with_message(
                    ErrorCode::Unauthorized,
                    "Authentication required",
                ))
            }
            _ => {
                warn!(method = %request.method, "Rejected request with invalid token");
                Err(ErrorObject::with_message(
                    ErrorCode::Unauthorized,
                    "Invalid authentication token",
                ))
            }
        }
    }

    fn route(&self, session: &Session, request: &Request) -> Result<Value, ErrorObject> {
        match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(session, request),
            methods::PING => Ok(json!({})),
            methods::RESOURCES_LIST => self.handle_resources_list(request),
            methods::RESOURCES_READ => self.handle_resources_read(request),
            methods::TOOLS_LIST => self.handle_tools_list(request),
            methods::TOOLS_CALL => self.handle_tools_call(request),
            methods::PROMPTS_LIST => self.handle_prompts_list(request),
            methods::PROMPTS_GET => self.handle_prompts_get(request),
            methods::SHUTDOWN => Ok(self.handle_shutdown()),
            other => Err(ErrorObject::with_message(
                ErrorCode::MethodNotFound,
                format!("Method not found: {other}"),
            )),
        }
    }

    fn handle_initialize(&self, session: &Session, request: &Request) -> Result<Value, ErrorObject> {
        if session.initialized.swap(true, Ordering::SeqCst) {
            return Err(ErrorObject::with_message(
                ErrorCode::InvalidRequest,
                "Server already initialised",
            ));
        }

        let params = request.params.as_ref();
        let client = params
            .and_then(|p| p.get("clientInfo"))
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(MCP_PROTOCOL_VERSION);
        info!(client, protocol_version = requested, "Client initialising");

        let capabilities = Capabilities {
            resources: true,
            tools: true,
            prompts: true,
            ..Capabilities::default()
        };
        let server_info = Implementation {
            name: self.shared.config.name.clone(),
            ..Implementation::default()
        };
        Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": capabilities.to_value(),
            "serverInfo": server_info,
        }))
    }

    /// Page size for a list request: the configured size, narrowed by the
    /// client's `limit` hint.
    fn page_limit(&self, request: &Request) -> Option<usize> {
        let hint = request
            .params
            .as_ref()
            .and_then(|p| p.get("limit"))
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n > 0);
        match (self.shared.config.page_size, hint) {
            (Some(size), Some(hint)) => Some(size.min(hint)),
            (size, hint) => size.or(hint),
        }
    }

    fn handle_resources_list(&self, request: &Request) -> Result<Value, ErrorObject> {
        let cursor = cursor_param(request)?;
        let page = self
            .shared
            .resources
            .page(cursor, self.page_limit(request));
        let resources = page
            .entries
            .into_iter()
            .map(|(uri, provider)| ResourceInfo {
                name: provider.name().unwrap_or_else(|| uri.clone()),
                description: non_empty(provider.description()),
                mime_type: Some(provider.mime_type()),
                size: provider.size(),
                uri,
            })
            .collect();
        encode(&ListResourcesResult {
            resources,
            next_cursor: page.next_cursor,
        })
    }

    fn handle_resources_read(&self, request: &Request) -> Result<Value, ErrorObject> {
        let uri = request.param_str("uri").ok_or_else(|| {
            ErrorObject::with_message(ErrorCode::InvalidParams, "Missing uri parameter")
        })?;
        let provider = self.shared.resources.get(uri).ok_or_else(|| {
            ErrorObject::with_message(
                ErrorCode::ResourceNotFound,
                format!("Resource not found: {uri}"),
            )
        })?;

        if provider.is_refreshable() && provider.should_refresh() {
            if let Err(e) = provider.refresh() {
                warn!(uri, error = %e, "Refresh failed; serving previous content");
            }
        }

        let data = provider.read().map_err(|e| {
            ErrorObject::with_message(
                ErrorCode::InternalError,
                format!("Failed to read resource {uri}: {e}"),
            )
        })?;
        debug!(uri, bytes = data.text.len(), "Resource read");
        encode(&ReadResourceResult {
            contents: vec![ResourceContent {
                uri: uri.to_string(),
                mime_type: Some(data.mime_type),
                text: Some(data.text),
                blob: None,
            }],
        })
    }

    fn handle_tools_list(&self, request: &Request) -> Result<Value, ErrorObject> {
        let cursor = cursor_param(request)?;
        let page = self.shared.tools.page(cursor, self.page_limit(request));
        let tools = page
            .entries
            .into_iter()
            .map(|(name, handler)| ToolInfo {
                description: non_empty(handler.description().to_string()),
                input_schema: handler.input_schema().to_value(),
                name,
            })
            .collect();
        encode(&ListToolsResult {
            tools,
            next_cursor: page.next_cursor,
        })
    }

    fn handle_tools_call(&self, request: &Request) -> Result<Value, ErrorObject> {
        let name = request.param_str("name").ok_or_else(|| {
            ErrorObject::with_message(ErrorCode::InvalidParams, "Missing tool name")
        })?;
        let empty = json!({});
        let arguments = match request.params.as_ref().and_then(|p| p.get("arguments")) {
            None | Some(Value::Null) => &empty,
            Some(arguments @ Value::Object(_)) => arguments,
            Some(_) => {
                return Err(ErrorObject::with_message(
                    ErrorCode::InvalidParams,
                    "Tool arguments must be an object",
                ))
            }
        };
        let handler = self.shared.tools.get(name).ok_or_else(|| {
            ErrorObject::with_message(ErrorCode::ToolNotFound, format!("Tool not found: {name}"))
        })?;

        handler
            .input_schema()
            .validate(arguments)
            .map_err(|message| ErrorObject::with_message(ErrorCode::InvalidToolInput, message))?;

        debug!(tool = name, "Calling tool");
        let result = handler.execute(arguments).map_err(|e| {
            warn!(tool = name, error = %e, "Tool failed");
            ErrorObject::with_message(ErrorCode::InvalidToolInput, e.message)
        })?;
        encode(&result)
    }

    fn handle_prompts_list(&self, request: &Request) -> Result<Value, ErrorObject> {
        let cursor = cursor_param(request)?;
        let page = self
            .shared
            .templates
            .page(cursor, self.page_limit(request));
        encode(&ListPromptsResult {
            prompts: page
                .entries
                .iter()
                .map(|(_, template)| template.info())
                .collect(),
            next_cursor: page.next_cursor,
        })
    }

    fn handle_prompts_get(&self, request: &Request) -> Result<Value, ErrorObject> {
        let name = request.param_str("name").ok_or_else(|| {
            ErrorObject::with_message(ErrorCode::InvalidParams, "Missing prompt name")
        })?;
        let template_error =
            |e: TemplateError| ErrorObject::with_message(ErrorCode::InvalidParams, e.to_string());
        let arguments = templates::arguments_from_value(
            request.params.as_ref().and_then(|p| p.get("arguments")),
        )
        .map_err(template_error)?;
        let template = self.shared.templates.template(name).map_err(template_error)?;
        template
            .validate_arguments(&arguments)
            .and_then(|()| template.render(&arguments))
            .map(|text| templates::prompt_result(&template, text))
            .map_err(|e| {
                debug!(prompt = name, error = %e, "Prompt rejected");
                template_error(e)
            })
    }

    fn handle_shutdown(&self) -> Value {
        info!(server = %self.shared.config.name, "Shutdown requested");
        let mut state = self.state_lock();
        if *state == ServerState::Running {
            *state = ServerState::ShuttingDown;
        }
        json!({
            "status": "shutting down",
            "message": "Server shutdown initiated",
        })
    }
}

fn cursor_param(request: &Request) -> Result<Option<&str>, ErrorObject> {
    match request.params.as_ref().and_then(|p| p.get("cursor")) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(cursor)) if cursor.is_empty() => Ok(None),
        Some(Value::String(cursor)) => Ok(Some(cursor)),
        Some(_) => Err(ErrorObject::with_message(
            ErrorCode::InvalidParams,
            "cursor must be a string",
        )),
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, ErrorObject> {
    serde_json::to_value(value)
        .map_err(|e| ErrorObject::with_message(ErrorCode::InternalError, e.to_string()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::mcp::protocol::RequestId;
    use crate::mcp::transport::MemoryTransport;
    use crate::mcp::types::CallToolResult;

    fn running(config: ServerConfig) -> McpServer {
        let server = McpServer::new(config);
        server.start(&SecurityPolicy::new()).unwrap();
        server
    }

    fn request(id: i64, method: &str, params: Option<Value>) -> Request {
        Request {
            id: RequestId::Number(id),
            method: method.to_string(),
            params,
        }
    }

    fn error_code(reply: &Message) -> i32 {
        match reply {
            Message::Error(e) => e.error.code,
            other => panic!("expected an error reply, got {other:?}"),
        }
    }

    fn result(reply: Message) -> Value {
        match reply {
            Message::Response(r) => r.result,
            other => panic!("expected a result, got {other:?}"),
        }
    }

    fn with_echo_tool(server: &McpServer) {
        let schema = ToolInputSchema::new().required("text", JsonType::String, "Text to echo");
        server.register_tool(Arc::new(FnTool::new("echo", "Echoes text", schema, |args| {
            Ok(CallToolResult::text(
                args["text"].as_str().unwrap_or_default(),
            ))
        })));
    }

    #[test]
    fn initialize_reports_capabilities_once() {
        let server = running(ServerConfig::new("unit"));
        let session = Session::new();
        let reply = server.handle_request(&session, &request(
            1,
            methods::INITIALIZE,
            Some(json!({"protocolVersion": MCP_PROTOCOL_VERSION, "clientInfo": {"name": "t"}})),
        ));
        let value = result(reply);
        assert_eq!(value["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(value["serverInfo"]["name"], "unit");
        assert!(value["capabilities"]["tools"].is_object());
        assert!(value["capabilities"]["resources"].is_object());
        assert!(value["capabilities"]["prompts"].is_object());

        let again = server.handle_request(&session, &request(2, methods::INITIALIZE, None));
        assert_eq!(error_code(&again), ErrorCode::InvalidRequest.code());
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let server = running(ServerConfig::default());
        let session = Session::new();
        let reply = server.handle_request(&session, &request(4, "completion/complete", None));
        assert_eq!(error_code(&reply), -32601);
        assert_eq!(reply.id(), Some(&RequestId::Number(4)));
    }

    #[test]
    fn read_requires_uri_and_known_resource() {
        let server = running(ServerConfig::default());
        let session = Session::new();
        server.publish_resource("mem://a", Arc::new(StaticResource::new("alpha")));

        let missing = server.handle_request(&session, &request(1, methods::RESOURCES_READ, Some(json!({}))));
        assert_eq!(error_code(&missing), ErrorCode::InvalidParams.code());

        let unknown = server.handle_request(&session, &request(
            2,
            methods::RESOURCES_READ,
            Some(json!({"uri": "mem://b"})),
        ));
        assert_eq!(error_code(&unknown), -32001);

        let value = result(server.handle_request(&session, &request(
            3,
            methods::RESOURCES_READ,
            Some(json!({"uri": "mem://a"})),
        )));
        assert_eq!(value["contents"][0]["uri"], "mem://a");
        assert_eq!(value["contents"][0]["mimeType"], "text/plain");
        assert_eq!(value["contents"][0]["text"], "alpha");
    }

    #[test]
    fn tool_errors_map_to_protocol_codes() {
        let server = running(ServerConfig::default());
        let session = Session::new();
        with_echo_tool(&server);
        server.register_tool(Arc::new(FnTool::new(
            "fail",
            "",
            ToolInputSchema::new(),
            |_| Err(HandlerError::new("disk full")),
        )));

        let unknown = server.handle_request(&session, &request(
            7,
            methods::TOOLS_CALL,
            Some(json!({"name": "nope", "arguments": {}})),
        ));
        assert_eq!(error_code(&unknown), -32002);
        assert_eq!(unknown.id(), Some(&RequestId::Number(7)));

        let bad_input = server.handle_request(&session, &request(
            8,
            methods::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": {"text": 5}})),
        ));
        assert_eq!(error_code(&bad_input), -32003);

        let failed = server.handle_request(&session, &request(
            9,
            methods::TOOLS_CALL,
            Some(json!({"name": "fail", "arguments": {}})),
        ));
        match failed {
            Message::Error(e) => {
                assert_eq!(e.error.code, -32003);
                assert_eq!(e.error.message, "disk full");
            }
            other => panic!("unexpected reply {other:?}"),
        }

        let not_object = server.handle_request(&session, &request(
            10,
            methods::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": "text"})),
        ));
        assert_eq!(error_code(&not_object), ErrorCode::InvalidParams.code());
    }

    #[test]
    fn tool_call_returns_text_content() {
        let server = running(ServerConfig::default());
        let session = Session::new();
        with_echo_tool(&server);
        let value = result(server.handle_request(&session, &request(
            1,
            methods::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
        )));
        assert_eq!(value, json!({"content": [{"type": "text", "text": "hi"}]}));
    }

    #[test]
    fn panicking_tool_becomes_internal_error() {
        let server = running(ServerConfig::default());
        let session = Session::new();
        server.register_tool(Arc::new(FnTool::new(
            "boom",
            "",
            ToolInputSchema::new(),
            |_| panic!("exploded"),
        )));
        let reply = server.handle_request(&session, &request(
            1,
            methods::TOOLS_CALL,
            Some(json!({"name": "boom", "arguments": {}})),
        ));
        match reply {
            Message::Error(e) => {
                assert_eq!(e.error.code, ErrorCode::InternalError.code());
                assert!(e.error.message.contains("exploded"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn auth_is_checked_before_routing() {
        let server = running(ServerConfig::default().with_auth_token("s3cret"));
        let anonymous = server.handle_request(&Session::new(), &request(1, methods::PING, None));
        assert_eq!(error_code(&anonymous), -32000);

        let wrong = server.handle_request(
            &Session::with_credential("guess"),
            &request(2, "no/such/method", None),
        );
        assert_eq!(error_code(&wrong), -32000);

        let ok = server.handle_request(
            &Session::with_credential("s3cret"),
            &request(3, methods::PING, None),
        );
        assert_eq!(result(ok), json!({}));
    }

    #[test]
    fn sessions_initialise_independently() {
        let server = running(ServerConfig::default());
        let first = Session::new();
        let second = Session::new();
        let init = || request(1, methods::INITIALIZE, Some(json!({"clientInfo": {"name": "t"}})));

        assert!(matches!(server.handle_request(&first, &init()), Message::Response(_)));
        assert!(first.is_initialized());
        assert!(!second.is_initialized());
        assert!(matches!(server.handle_request(&second, &init()), Message::Response(_)));
        assert_eq!(
            error_code(&server.handle_request(&first, &init())),
            ErrorCode::InvalidRequest.code()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_connections_each_complete_handshake() {
        let server = running(ServerConfig::default());
        let first = MemoryTransport::new();
        let second = MemoryTransport::new();
        for transport in [&first, &second] {
            transport.queue_incoming(Message::request(
                1,
                methods::INITIALIZE,
                Some(json!({"clientInfo": {"name": "peer"}})),
            ));
            transport.queue_incoming(Message::request(2, methods::PING, None));
        }

        let a = server.spawn(Box::new(first.clone()));
        let b = server.spawn(Box::new(second.clone()));
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        for transport in [&first, &second] {
            let replies = transport.drain_outgoing();
            assert_eq!(replies.len(), 2);
            assert!(replies.iter().all(|reply| !reply.is_error()), "{replies:?}");
        }
    }

    #[test]
    fn prompts_are_listed_and_rendered() {
        let server = running(ServerConfig::default().with_page_size(1));
        let session = Session::new();
        server.register_template(
            PromptTemplate::new("review", "Reviews code", "Review {file} for {focus}.")
                .argument("file", "Path", true)
                .argument("focus", "", false),
        );
        server.register_template(PromptTemplate::new("hello", "", "Hi"));

        let first = result(server.handle_request(&session, &request(1, methods::PROMPTS_LIST, None)));
        assert_eq!(first["prompts"][0]["name"], "hello");
        assert_eq!(first["nextCursor"], "hello");
        let second = result(server.handle_request(&session, &request(
            2,
            methods::PROMPTS_LIST,
            Some(json!({"cursor": "hello"})),
        )));
        assert_eq!(second["prompts"][0]["arguments"][0]["required"], true);

        let rendered = result(server.handle_request(&session, &request(
            3,
            methods::PROMPTS_GET,
            Some(json!({"name": "review", "arguments": {"file": "main.rs"}})),
        )));
        assert_eq!(rendered["description"], "Reviews code");
        assert_eq!(rendered["messages"][0]["role"], "user");
        assert_eq!(rendered["messages"][0]["content"]["text"], "Review main.rs for .");

        let missing = server.handle_request(&session, &request(
            4,
            methods::PROMPTS_GET,
            Some(json!({"name": "review"})),
        ));
        assert_eq!(error_code(&missing), ErrorCode::InvalidParams.code());

        let unknown = server.handle_request(&session, &request(
            5,
            methods::PROMPTS_GET,
            Some(json!({"name": "nope"})),
        ));
        assert_eq!(error_code(&unknown), ErrorCode::InvalidParams.code());
        assert!(server.status().to_string().contains("2 prompts"));
    }

    #[test]
    fn zero_page_size_still_lists_every_entry() {
        let server = running(ServerConfig::default().with_page_size(0));
        let session = Session::new();
        for uri in ["mem://a", "mem://b"] {
            server.publish_resource(uri, Arc::new(StaticResource::new(uri)));
        }
        let first = result(server.handle_request(&session, &request(1, methods::RESOURCES_LIST, None)));
        assert_eq!(first["resources"].as_array().unwrap().len(), 1);
        assert_eq!(first["nextCursor"], "mem://a");
    }

    #[test]
    fn lists_are_paginated_by_key() {
        let server = running(ServerConfig::default().with_page_size(2));
        let session = Session::new();
        for uri in ["mem://c", "mem://a", "mem://b"] {
            server.publish_resource(uri, Arc::new(StaticResource::new(uri)));
        }
        let first = result(server.handle_request(&session, &request(1, methods::RESOURCES_LIST, None)));
        assert_eq!(first["resources"].as_array().unwrap().len(), 2);
        assert_eq!(first["nextCursor"], "mem://b");

        let second = result(server.handle_request(&session, &request(
            2,
            methods::RESOURCES_LIST,
            Some(json!({"cursor": "mem://b"})),
        )));
        assert_eq!(second["resources"][0]["uri"], "mem://c");
        assert!(second.get("nextCursor").is_none());

        let hinted = result(server.handle_request(&session, &request(
            3,
            methods::RESOURCES_LIST,
            Some(json!({"limit": 1})),
        )));
        assert_eq!(hinted["resources"].as_array().unwrap().len(), 1);

        let bad = server.handle_request(&session, &request(4, methods::TOOLS_LIST, Some(json!({"cursor": 5}))));
        assert_eq!(error_code(&bad), ErrorCode::InvalidParams.code());
    }

    #[test]
    fn tools_list_includes_schema() {
        let server = running(ServerConfig::default());
        let session = Session::new();
        with_echo_tool(&server);
        let value = result(server.handle_request(&session, &request(1, methods::TOOLS_LIST, None)));
        let tool = &value["tools"][0];
        assert_eq!(tool["name"], "echo");
        assert_eq!(tool["description"], "Echoes text");
        assert_eq!(tool["inputSchema"]["required"], json!(["text"]));
    }

    #[test]
    fn start_is_vetoed_when_serving_disabled() {
        let policy = SecurityPolicy::new();
        policy.disable_serving();
        let server = McpServer::new(ServerConfig::default());
        assert!(matches!(
            server.start(&policy),
            Err(McpError::Security(crate::error::SecurityError::ServingDisabled))
        ));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn serve_requires_start() {
        let server = McpServer::new(ServerConfig::default());
        let mut transport = MemoryTransport::new();
        assert!(matches!(
            server.serve(&mut transport).await,
            Err(McpError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn serve_answers_until_queue_drains() {
        let server = running(ServerConfig::default());
        server.publish_resource("mem://a", Arc::new(StaticResource::new("alpha")));
        let transport = MemoryTransport::new();
        transport.queue_incoming(Message::request(1, methods::PING, None));
        transport.queue_incoming(Message::notification(methods::INITIALIZED, None));
        transport.queue_incoming(Message::request(2, methods::RESOURCES_LIST, None));

        let mut driven = transport.clone();
        server.serve(&mut driven).await.unwrap();

        let replies = transport.drain_outgoing();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].id(), Some(&RequestId::Number(2)));

        let status = server.status();
        assert_eq!(status.requests_received, 2);
        assert_eq!(status.responses_sent, 2);
        assert_eq!(status.errors_returned, 0);
        assert_eq!(status.active_connections, 0);
        assert_eq!(status.resources, 1);
        assert_eq!(status.state, ServerState::Running);
    }

    #[tokio::test]
    async fn shutdown_stops_after_replying() {
        let server = running(ServerConfig::default());
        let transport = MemoryTransport::new();
        transport.queue_incoming(Message::request(1, methods::SHUTDOWN, None));
        transport.queue_incoming(Message::request(2, methods::PING, None));

        let mut driven = transport.clone();
        server.serve(&mut driven).await.unwrap();

        let replies = transport.drain_outgoing();
        assert_eq!(replies.len(), 1);
        let value = match &replies[0] {
            Message::Response(r) => r.result.clone(),
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(value["status"], "shutting down");
        assert_eq!(transport.incoming_len(), 1);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn status_display_mentions_counts() {
        let server = McpServer::new(ServerConfig::new("shown"));
        let text = server.status().to_string();
        assert!(text.starts_with("shown (stopped)"));
        assert!(text.contains("0 requests"));
    }
}
